//! Fisher matrices: the count-based information sum, priors, padding, persistence and
//! marginalized errors.
//!
//! For binned Poisson counts $N_b$ the Fisher matrix is
//!
//! $$ F_{ij} = \sum_b \frac{\partial_i N_b\, \partial_j N_b}{N_b}, $$
//!
//! where bins without fiducial clusters carry no information.
use crate::core::grids::CountGrid;
use crate::error::{Error, Result};

use log::debug;
use nalgebra::DMatrix;
use ndarray::{s, Array2, Array3, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Parameters the cluster counts carry no information on; their rows and columns of the count
/// Fisher matrix are zero and their derivatives are never loaded.
pub const ZERO_INFORMATION_PARAMETERS: [&str; 1] = ["tau"];

/// Gaussian priors, in the order they were given. Every parameter has at most one prior; the
/// first one given wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PriorSet {
    priors: Vec<(String, f64)>,
}

impl PriorSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Priors from parallel lists of names and widths.
    pub fn from_lists(names: &[String], sigmas: &[f64]) -> Result<Self> {
        if names.len() != sigmas.len() {
            return Err(Error::config(format!(
                "{} prior names but {} prior widths",
                names.len(),
                sigmas.len()
            )));
        }

        let mut set = Self::new();
        for (name, sigma) in names.iter().zip(sigmas) {
            set.push(name, *sigma)?;
        }

        Ok(set)
    }

    /// Add a prior of width `sigma` on `name`, unless `name` already has one.
    pub fn push(&mut self, name: &str, sigma: f64) -> Result<()> {
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(Error::config(format!(
                "prior width of `{}` must be positive, got {}",
                name, sigma
            )));
        }

        if let Some(first) = self.sigma(name) {
            debug!("prior {} on `{}` ignored, keeping {}", sigma, name, first);
            return Ok(());
        }

        self.priors.push((name.to_string(), sigma));
        Ok(())
    }

    /// Width of the prior on `name`.
    pub fn sigma(&self, name: &str) -> Option<f64> {
        self.priors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sigma)| *sigma)
    }

    /// Whether `name` has a prior.
    pub fn contains(&self, name: &str) -> bool {
        self.sigma(name).is_some()
    }

    /// Iterate over (name, width) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.priors.iter().map(|(n, s)| (n.as_str(), *s))
    }

    /// Number of priors
    pub fn len(&self) -> usize {
        self.priors.len()
    }

    /// Whether there are no priors.
    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }
}

/// A square matrix whose rows and columns are labelled by parameter names.
///
/// Row and column `i` belong to `params()[i]`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(try_from = "(Vec<String>, Array2<f64>)", into = "(Vec<String>, Array2<f64>)")]
pub struct FisherMatrix {
    params: Vec<String>,
    matrix: Array2<f64>,
}

impl TryFrom<(Vec<String>, Array2<f64>)> for FisherMatrix {
    type Error = Error;

    fn try_from((params, matrix): (Vec<String>, Array2<f64>)) -> Result<Self> {
        Self::new(params, matrix)
    }
}

impl From<FisherMatrix> for (Vec<String>, Array2<f64>) {
    fn from(fisher: FisherMatrix) -> Self {
        (fisher.params, fisher.matrix)
    }
}

impl FisherMatrix {
    /// Label `matrix` with `params`.
    pub fn new(params: Vec<String>, matrix: Array2<f64>) -> Result<Self> {
        if matrix.dim() != (params.len(), params.len()) {
            return Err(Error::config(format!(
                "Fisher matrix of shape {:?} for {} parameters",
                matrix.dim(),
                params.len()
            )));
        }

        for (i, param) in params.iter().enumerate() {
            if params[..i].contains(param) {
                return Err(Error::config(format!("duplicate Fisher parameter `{}`", param)));
            }
        }

        Ok(Self { params, matrix })
    }

    /// A zero matrix for `params`.
    pub fn zeros(params: Vec<String>) -> Result<Self> {
        let n = params.len();
        Self::new(params, Array2::zeros((n, n)))
    }

    /// Parameter names
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The matrix
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Destructure into names and matrix.
    pub fn into_parts(self) -> (Vec<String>, Array2<f64>) {
        (self.params, self.matrix)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the matrix has no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Position of `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p == name)
    }

    /// The entry belonging to the parameters `a` and `b`.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.matrix[[self.index_of(a)?, self.index_of(b)?]])
    }

    /// Whether $|F_{ij} - F_{ji}| \le \epsilon$ for all entries.
    pub fn is_symmetric(&self, epsilon: f64) -> bool {
        let n = self.len();
        (0..n).all(|i| (0..i).all(|j| (self.matrix[[i, j]] - self.matrix[[j, i]]).abs() <= epsilon))
    }

    /// Add $1/\sigma^2$ to the diagonal entry of every parameter with a prior. Priors on
    /// parameters that are not part of the matrix are ignored.
    pub fn add_priors(&mut self, priors: &PriorSet) {
        for (name, sigma) in priors.iter() {
            match self.index_of(name) {
                Some(i) => self.matrix[[i, i]] += 1.0 / (sigma * sigma),
                None => debug!("prior on `{}` ignored, not a Fisher parameter", name),
            }
        }
    }

    /// A copy with `extra` parameters appended; their rows and columns are zero.
    pub fn pad(&self, extra: &[String]) -> Result<Self> {
        let n = self.len();
        let mut params = self.params.clone();
        params.extend_from_slice(extra);

        let mut matrix = Array2::zeros((params.len(), params.len()));
        matrix.slice_mut(s![..n, ..n]).assign(&self.matrix);

        Self::new(params, matrix)
    }

    /// Add `block` to the upper-left corner, as if it were zero-padded to the full size.
    pub fn add_leading_block(&mut self, block: ArrayView2<f64>) -> Result<()> {
        let (rows, cols) = block.dim();
        if rows != cols || rows > self.len() {
            return Err(Error::config(format!(
                "cannot add a {}x{} block to a Fisher matrix with {} parameters",
                rows,
                cols,
                self.len()
            )));
        }

        let mut corner = self.matrix.slice_mut(s![..rows, ..rows]);
        corner += &block;
        Ok(())
    }

    /// Add `other`, whose parameters must be the leading parameters of this matrix.
    pub fn add_leading_fisher(&mut self, other: &FisherMatrix) -> Result<()> {
        if other.len() > self.len() || self.params[..other.len()] != other.params[..] {
            return Err(Error::config(format!(
                "parameters {:?} are not the leading parameters of {:?}",
                other.params, self.params
            )));
        }

        self.add_leading_block(other.matrix.view())
    }

    /// A copy without the parameters in `names`.
    pub fn delete(&self, names: &[&str]) -> Self {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| !names.contains(&self.params[i].as_str()))
            .collect();

        Self {
            params: keep.iter().map(|&i| self.params[i].clone()).collect(),
            matrix: Array2::from_shape_fn((keep.len(), keep.len()), |(i, j)| {
                self.matrix[[keep[i], keep[j]]]
            }),
        }
    }

    /// The covariance matrix $F^{-1}$.
    pub fn covariance(&self) -> Result<Array2<f64>> {
        let n = self.len();
        let matrix = DMatrix::from_fn(n, n, |i, j| self.matrix[[i, j]]);
        let inverse = matrix
            .try_inverse()
            .ok_or_else(|| Error::numerical("singular Fisher matrix"))?;

        Ok(Array2::from_shape_fn((n, n), |(i, j)| inverse[(i, j)]))
    }

    /// Marginalized one-sigma errors $\sqrt{(F^{-1})_{ii}}$ of all parameters.
    pub fn marginalized_errors(&self) -> Result<Vec<(String, f64)>> {
        let covariance = self.covariance()?;

        self.params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let variance = covariance[[i, i]];
                if variance > 0.0 && variance.is_finite() {
                    Ok((p.clone(), variance.sqrt()))
                } else {
                    Err(Error::numerical(format!(
                        "marginalized variance of `{}` is {}",
                        p, variance
                    )))
                }
            })
            .collect()
    }

    /// Marginalized one-sigma error of `name`.
    pub fn sigma(&self, name: &str) -> Result<f64> {
        let index = self
            .index_of(name)
            .ok_or_else(|| Error::config(format!("`{}` is not a Fisher parameter", name)))?;

        Ok(self.marginalized_errors()?[index].1)
    }

    /// Write the matrix, as JSON for `.json` paths and as delimited text with a `#p1,p2,...`
    /// header for `.txt` paths.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        match extension(path) {
            Some("json") => {
                serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
            }
            Some("txt") => {
                let mut file = BufWriter::new(File::create(path)?);
                writeln!(file, "#{}", self.params.join(","))?;

                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(file);
                for row in self.matrix.rows() {
                    writer.serialize(row.to_vec())?;
                }
                writer.flush()?;
            }
            _ => {
                return Err(Error::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        }

        Ok(())
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

/// Read a Fisher matrix saved with [`FisherMatrix::save`] or by another tool.
///
/// Text files carry the parameter names as a `#`-prefixed, comma-separated header and the rows
/// delimited by commas or, failing that, by spaces.
pub fn load_fisher<P: AsRef<Path>>(path: P) -> Result<FisherMatrix> {
    let path = path.as_ref();

    match extension(path) {
        Some("json") | Some("txt") if !path.exists() => Err(Error::MissingArtifact {
            path: path.to_path_buf(),
        }),
        Some("json") => Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?),
        Some("txt") => load_text(path),
        _ => Err(Error::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

fn load_text(path: &Path) -> Result<FisherMatrix> {
    let text = fs::read_to_string(path)?;
    let header = text.lines().next().unwrap_or_default();
    let params: Vec<String> = header
        .trim_start_matches('#')
        .replace(' ', "")
        .split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    let rows = read_rows(&text, b',').or_else(|_| read_rows(&text, b' '))?;
    let n = rows.len();
    let values: Vec<f64> = rows.into_iter().flatten().collect();

    let matrix = Array2::from_shape_vec((n, values.len() / n.max(1)), values)?;
    FisherMatrix::new(params, matrix)
}

fn read_rows(text: &str, delimiter: u8) -> Result<Vec<Vec<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = record
            .iter()
            .filter(|field| !field.is_empty())
            .map(|field| {
                field
                    .parse::<f64>()
                    .map_err(|_| Error::config(format!("`{}` is not a number", field)))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(first) = rows.first().map(Vec::len) {
            if first != row.len() {
                return Err(Error::config("rows of different length"));
            }
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Supplies $\partial N / \partial p$ on the same grid as the fiducial counts.
pub trait DerivativeSource {
    /// The derivative of the counts with respect to `param`.
    fn derivative(&self, param: &str) -> Result<Array3<f64>>;
}

/// $\sum_b \partial_i N_b\, \partial_j N_b / N_b$, where bins with $N_b = 0$ contribute nothing.
pub fn fisher_element(fiducial: &Array3<f64>, d1: &Array3<f64>, d2: &Array3<f64>) -> f64 {
    let mut sum = 0.0;

    Zip::from(fiducial).and(d1).and(d2).for_each(|&n, &a, &b| {
        if n != 0.0 {
            sum += a * b / n;
        }
    });

    sum
}

/// The Fisher matrix of the binned counts `fiducial` for `params`, including `priors`.
///
/// Every derivative is requested once. Pairs with a parameter from
/// [`ZERO_INFORMATION_PARAMETERS`] are zero without consulting `derivatives`.
pub fn get_fisher(
    fiducial: &CountGrid,
    params: &[String],
    priors: &PriorSet,
    derivatives: &dyn DerivativeSource,
) -> Result<FisherMatrix> {
    let mut fisher = FisherMatrix::zeros(params.to_vec())?;
    let mut cache: HashMap<&str, Array3<f64>> = HashMap::new();

    for param in params {
        if ZERO_INFORMATION_PARAMETERS.contains(&param.as_str()) {
            continue;
        }

        let derivative = derivatives.derivative(param)?;
        if derivative.dim() != fiducial.counts().dim() {
            return Err(Error::config(format!(
                "derivative with respect to `{}` has shape {:?}, the fiducial counts {:?}",
                param,
                derivative.dim(),
                fiducial.counts().dim()
            )));
        }

        if derivative.iter().any(|v| !v.is_finite()) {
            return Err(Error::numerical(format!(
                "non-finite value in the derivative with respect to `{}`",
                param
            )));
        }

        cache.insert(param.as_str(), derivative);
    }

    for (i, p1) in params.iter().enumerate() {
        for (j, p2) in params.iter().enumerate().skip(i) {
            let value = match (cache.get(p1.as_str()), cache.get(p2.as_str())) {
                (Some(d1), Some(d2)) => fisher_element(fiducial.counts(), d1, d2),
                _ => 0.0,
            };

            fisher.matrix[[i, j]] = value;
            fisher.matrix[[j, i]] = value;
        }
    }

    fisher.add_priors(priors);

    Ok(fisher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::array;
    use tempfile::tempdir;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    struct Constant(HashMap<String, f64>);

    impl DerivativeSource for Constant {
        fn derivative(&self, param: &str) -> Result<Array3<f64>> {
            assert_ne!(param, "tau");
            Ok(Array3::from_elem((2, 2, 1), self.0[param]))
        }
    }

    #[test]
    fn empty_bins_carry_no_information() {
        let fiducial = array![[[0.0], [2.0]]];
        let d = array![[[5.0], [1.0]]];
        assert_eq!(fisher_element(&fiducial, &d, &d), 0.5);
    }

    #[test]
    fn tau_is_never_loaded() {
        let fiducial = CountGrid::new(Array3::from_elem((2, 2, 1), 5.0)).unwrap();
        let source = Constant(vec![("A".to_string(), 1.0)].into_iter().collect());

        let fisher = get_fisher(&fiducial, &names(&["tau", "A"]), &PriorSet::new(), &source).unwrap();
        assert_eq!(fisher.get("tau", "tau"), Some(0.0));
        assert_eq!(fisher.get("tau", "A"), Some(0.0));
        assert_approx_eq!(fisher.get("A", "A").unwrap(), 0.8, 1e-14);
    }

    #[test]
    fn priors_only_touch_the_diagonal() {
        let mut fisher = FisherMatrix::new(names(&["a", "b"]), array![[1.0, 0.5], [0.5, 2.0]]).unwrap();
        let mut priors = PriorSet::new();
        priors.push("b", 0.1).unwrap();
        priors.push("c", 1.0).unwrap();

        fisher.add_priors(&priors);
        assert_approx_eq!(fisher.get("b", "b").unwrap(), 102.0, 1e-12);
        assert_eq!(fisher.get("a", "b"), Some(0.5));
        assert_eq!(fisher.get("a", "a"), Some(1.0));

        assert!(priors.push("d", 0.0).is_err());
        assert!(PriorSet::from_lists(&names(&["a"]), &[]).is_err());
    }

    #[test]
    fn a_parameter_gets_one_prior() {
        let priors = PriorSet::from_lists(&names(&["H0", "H0"]), &[1.0, 0.5]).unwrap();
        assert_eq!(priors.len(), 1);
        assert_eq!(priors.sigma("H0"), Some(1.0));

        let mut fisher = FisherMatrix::zeros(names(&["H0"])).unwrap();
        fisher.add_priors(&priors);
        assert_approx_eq!(fisher.get("H0", "H0").unwrap(), 1.0, 1e-15);
    }

    #[test]
    fn non_finite_derivatives_are_fatal() {
        let fiducial = CountGrid::new(Array3::from_elem((2, 2, 1), 5.0)).unwrap();

        for &bad in &[f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let source = Constant(vec![("A".to_string(), bad)].into_iter().collect());
            assert!(matches!(
                get_fisher(&fiducial, &names(&["A"]), &PriorSet::new(), &source),
                Err(Error::NumericalInstability(_))
            ));
        }
    }

    #[test]
    fn leading_blocks() {
        let mut fisher = FisherMatrix::zeros(names(&["H0", "om", "b_ym"])).unwrap();
        fisher.matrix[[2, 2]] = 7.0;

        let cmb = FisherMatrix::new(names(&["H0", "om"]), array![[1.0, 2.0], [2.0, 3.0]]).unwrap();
        fisher.add_leading_fisher(&cmb).unwrap();

        assert_eq!(fisher.get("om", "H0"), Some(2.0));
        assert_eq!(fisher.get("b_ym", "b_ym"), Some(7.0));
        assert_eq!(fisher.get("b_ym", "om"), Some(0.0));

        let wrong = FisherMatrix::zeros(names(&["om"])).unwrap();
        assert!(fisher.add_leading_fisher(&wrong).is_err());
        assert!(fisher.add_leading_block(Array2::zeros((4, 4)).view()).is_err());
    }

    #[test]
    fn padding_keeps_the_original_entries() {
        let fisher = FisherMatrix::new(names(&["a", "b"]), array![[1.0, 0.5], [0.5, 2.0]]).unwrap();
        let padded = fisher.pad(&names(&["c"])).unwrap();

        assert_eq!(padded.params(), &names(&["a", "b", "c"])[..]);
        assert_eq!(padded.matrix().slice(s![..2, ..2]), fisher.matrix().view());
        assert_eq!(padded.get("c", "c"), Some(0.0));
        assert!(fisher.pad(&names(&["a"])).is_err());
    }

    #[test]
    fn marginalized_errors() {
        let fisher = FisherMatrix::new(names(&["a", "b"]), array![[4.0, 0.0], [0.0, 0.25]]).unwrap();
        let errors = fisher.marginalized_errors().unwrap();

        assert_approx_eq!(errors[0].1, 0.5, 1e-14);
        assert_approx_eq!(fisher.sigma("b").unwrap(), 2.0, 1e-14);

        let correlated = FisherMatrix::new(names(&["a", "b"]), array![[2.0, 1.0], [1.0, 1.0]]).unwrap();
        // the covariance is [[1, -1], [-1, 2]]
        assert_approx_eq!(correlated.sigma("b").unwrap(), 2f64.sqrt(), 1e-12);

        let singular = FisherMatrix::zeros(names(&["a"])).unwrap();
        assert!(matches!(
            singular.marginalized_errors(),
            Err(Error::NumericalInstability(_))
        ));
    }

    #[test]
    fn delete_parameters() {
        let fisher = FisherMatrix::new(
            names(&["a", "b", "c"]),
            array![[1.0, 2.0, 3.0], [2.0, 4.0, 5.0], [3.0, 5.0, 6.0]],
        )
        .unwrap();

        let reduced = fisher.delete(&["b"]);
        assert_eq!(reduced.params(), &names(&["a", "c"])[..]);
        assert_eq!(reduced.matrix(), &array![[1.0, 3.0], [3.0, 6.0]]);
    }

    #[test]
    fn json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fisher.json");
        let fisher = FisherMatrix::new(names(&["a", "b"]), array![[1.0, 0.5], [0.5, 2.0]]).unwrap();

        fisher.save(&path).unwrap();
        assert_eq!(load_fisher(&path).unwrap(), fisher);
    }

    #[test]
    fn text_files_with_either_delimiter() {
        let dir = tempdir().unwrap();

        let comma = dir.path().join("comma.txt");
        fs::write(&comma, "#tau,H0\n10,0\n0,0\n").unwrap();
        let fisher = load_fisher(&comma).unwrap();
        assert_eq!(fisher.params(), &names(&["tau", "H0"])[..]);
        assert_eq!(fisher.matrix(), &array![[10.0, 0.0], [0.0, 0.0]]);

        let space = dir.path().join("space.txt");
        fs::write(&space, "# tau, H0\n10 0\n0 1\n").unwrap();
        assert_eq!(load_fisher(&space).unwrap().get("H0", "H0"), Some(1.0));

        let saved = dir.path().join("saved.txt");
        fisher.save(&saved).unwrap();
        assert_eq!(load_fisher(&saved).unwrap(), fisher);
    }

    #[test]
    fn unsupported_and_missing_files() {
        let dir = tempdir().unwrap();
        let pickle = dir.path().join("fisher.pkl");
        fs::write(&pickle, b"").unwrap();

        assert!(matches!(
            load_fisher(&pickle),
            Err(Error::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            load_fisher(dir.path().join("absent.txt")),
            Err(Error::MissingArtifact { .. })
        ));
    }
}
