//! Fisher matrix of the primary CMB, optionally with CMB lensing, from precomputed power spectra.
//!
//! The fiducial spectra and their derivatives are comma-separated tables with one row per
//! multipole, starting at $\ell = 0$, and the columns TT, EE, BB, TE and, optionally, the lensing
//! convergence $\kappa\kappa$. Temperature and polarization spectra are in $\mu\mathrm{K}^2$.
//! For every multipole the Gaussian likelihood contributes
//!
//! $$ F_{ij} = f_\mathrm{sky} \frac{2\ell + 1}{2} \mathrm{Tr}\left[ C^{-1} \partial_i C\, C^{-1}
//! \partial_j C \right], $$
//!
//! where $C$ is the $2\times2$ TT/TE/EE covariance including noise; BB and $\kappa\kappa$ are
//! treated as independent.
use crate::config::ExperimentConfig;
use crate::error::{Error, Result};
use crate::fisher::FisherMatrix;
use crate::integrators::interp;
use crate::noise::{read_two_columns, NoiseModel};

use log::info;
use nalgebra::Matrix2;
use ndarray::Array2;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Power spectra indexed by multipole.
#[derive(Clone, Debug, PartialEq)]
pub struct CmbSpectra {
    /// Temperature
    pub tt: Vec<f64>,
    /// E modes
    pub ee: Vec<f64>,
    /// B modes
    pub bb: Vec<f64>,
    /// Temperature-E cross spectrum
    pub te: Vec<f64>,
    /// Lensing convergence, if the table has a fifth column.
    pub kk: Option<Vec<f64>>,
}

impl CmbSpectra {
    /// Read a spectrum table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut columns: Vec<Vec<f64>> = Vec::new();
        for record in reader.records() {
            let row: Vec<f64> = record?.deserialize(None)?;

            if columns.is_empty() {
                if row.len() < 4 {
                    return Err(Error::config(format!(
                        "{}: expected at least the columns TT, EE, BB and TE",
                        path.display()
                    )));
                }
                columns = vec![Vec::new(); row.len().min(5)];
            }

            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }

        if columns.is_empty() {
            return Err(Error::config(format!("{} is empty", path.display())));
        }

        let kk = if columns.len() == 5 { columns.pop() } else { None };
        let te = columns.pop().unwrap_or_default();
        let bb = columns.pop().unwrap_or_default();
        let ee = columns.pop().unwrap_or_default();
        let tt = columns.pop().unwrap_or_default();

        Ok(Self { tt, ee, bb, te, kk })
    }

    /// Number of multipoles, counting from zero.
    pub fn len(&self) -> usize {
        self.tt.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.tt.is_empty()
    }

    fn temperature_block(&self, ell: usize, noise_t: f64, noise_p: f64) -> Matrix2<f64> {
        Matrix2::new(
            self.tt[ell] + noise_t,
            self.te[ell],
            self.te[ell],
            self.ee[ell] + noise_p,
        )
    }
}

/// Reconstruction noise $N_L^{\kappa\kappa}$ of CMB lensing.
#[derive(Clone, Debug, PartialEq)]
pub struct LensingNoise {
    ell: Vec<f64>,
    nkk: Vec<f64>,
}

impl LensingNoise {
    /// Constructor; `ell` must be increasing.
    pub fn new(ell: Vec<f64>, nkk: Vec<f64>) -> Result<Self> {
        if ell.is_empty() || ell.len() != nkk.len() || ell.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::config("lensing noise needs increasing, matching columns"));
        }

        Ok(Self { ell, nkk })
    }

    /// Read the space-separated columns $L$ and $N_L^{\kappa\kappa}$.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let (ell, nkk) = read_two_columns(path)?;
        Self::new(ell, nkk)
    }

    /// Noise at multipole `ell`, constant beyond the ends of the table.
    pub fn at(&self, ell: f64) -> f64 {
        interp(ell, &self.ell, &self.nkk)
    }
}

/// Path of the fiducial spectra below `root`.
pub fn fiducial_file(root: &Path) -> PathBuf {
    with_suffix(root, "_fCls.csv")
}

/// Path of the derivative of the spectra with respect to `param`.
pub fn derivative_file(root: &Path, param: &str) -> PathBuf {
    with_suffix(root, &format!("_dCls_{}.csv", param))
}

fn with_suffix(root: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(root.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Temperature and polarization noise of all channels of `experiment` combined with inverse
/// variance weights. Polarization has twice the temperature noise power.
fn channel_noise(experiment: &ExperimentConfig, ell: f64) -> (f64, f64) {
    let inverse: f64 = experiment
        .beams
        .iter()
        .zip(experiment.noises.iter())
        .map(|(&fwhm, &rms)| {
            let model = NoiseModel {
                rms_noise: rms,
                fwhm,
                lknee: experiment.lknee,
                alpha: experiment.alpha,
            };
            1.0 / model.noise_func(ell)
        })
        .sum();

    let noise_t = 1.0 / inverse;
    (noise_t, 2.0 * noise_t)
}

/// Fisher matrix of the spectra `fiducial` with derivatives `derivatives`, observed by
/// `experiment` between its `lmin` and `lmax`.
pub fn cmb_fisher(
    fiducial: &CmbSpectra,
    derivatives: &[(String, CmbSpectra)],
    experiment: &ExperimentConfig,
    lensing: Option<&LensingNoise>,
) -> Result<FisherMatrix> {
    let lmin = experiment.lmin as usize;
    let lmax = (experiment.lmax as usize).min(fiducial.len().saturating_sub(1));

    if derivatives.iter().any(|(_, d)| d.len() <= lmax) {
        return Err(Error::config("CMB derivatives cover fewer multipoles than the fiducial"));
    }

    let fid_kk = match lensing {
        Some(_) => Some(fiducial.kk.as_ref().ok_or_else(|| {
            Error::config("CMB lensing Fisher matrix needs a kk column in the fiducial spectra")
        })?),
        None => None,
    };

    let n = derivatives.len();
    let mut matrix = Array2::zeros((n, n));

    for ell in lmin..=lmax {
        let l = ell as f64;
        let modes = experiment.fsky * (2.0 * l + 1.0) / 2.0;
        let (noise_t, noise_p) = channel_noise(experiment, l);

        let inverse = fiducial
            .temperature_block(ell, noise_t, noise_p)
            .try_inverse()
            .ok_or_else(|| Error::numerical(format!("singular CMB covariance at ell = {}", ell)))?;

        let weighted: Vec<Matrix2<f64>> = derivatives
            .iter()
            .map(|(_, d)| inverse * d.temperature_block(ell, 0.0, 0.0))
            .collect();

        let bb_total = fiducial.bb[ell] + noise_p;
        let kk_total = match (fid_kk, lensing) {
            (Some(kk), Some(noise)) => Some(kk[ell] + noise.at(l)),
            _ => None,
        };

        for i in 0..n {
            for j in i..n {
                let mut value = (weighted[i] * weighted[j]).trace();

                let (di, dj) = (&derivatives[i].1, &derivatives[j].1);
                if bb_total > 0.0 {
                    value += di.bb[ell] * dj.bb[ell] / (bb_total * bb_total);
                }

                if let Some(total) = kk_total {
                    if let (Some(ki), Some(kj)) = (&di.kk, &dj.kk) {
                        value += ki[ell] * kj[ell] / (total * total);
                    }
                }

                matrix[[i, j]] += modes * value;
                if i != j {
                    matrix[[j, i]] += modes * value;
                }
            }
        }
    }

    if matrix.iter().any(|v: &f64| !v.is_finite()) {
        return Err(Error::numerical("non-finite CMB Fisher matrix"));
    }

    FisherMatrix::new(derivatives.iter().map(|(p, _)| p.clone()).collect(), matrix)
}

/// Load the spectra below `root` and compute the CMB Fisher matrix for `params`.
pub fn fisher_from_files(
    root: &Path,
    params: &[String],
    experiment: &ExperimentConfig,
    lensing: Option<&LensingNoise>,
) -> Result<FisherMatrix> {
    let fiducial = CmbSpectra::load(fiducial_file(root))?;
    let derivatives = params
        .iter()
        .map(|p| Ok((p.clone(), CmbSpectra::load(derivative_file(root, p))?)))
        .collect::<Result<Vec<_>>>()?;

    info!(
        "calculating CMB fisher matrix for {} parameters{}",
        params.len(),
        if lensing.is_some() { " with lensing" } else { "" }
    );

    cmb_fisher(&fiducial, &derivatives, experiment, lensing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::fs;
    use tempfile::tempdir;

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            beams: vec![1.5],
            noises: vec![0.0],
            freqs: vec![150.0],
            lmin: 2.0,
            lmax: 4.0,
            lknee: 0.0,
            alpha: 0.0,
            fsky: 0.5,
        }
    }

    fn spectra(tt: f64, ee: f64, kk: f64) -> CmbSpectra {
        CmbSpectra {
            tt: vec![tt; 6],
            ee: vec![ee; 6],
            bb: vec![0.0; 6],
            te: vec![0.0; 6],
            kk: Some(vec![kk; 6]),
        }
    }

    #[test]
    fn amplitude_of_the_temperature_spectrum() {
        let fiducial = spectra(1.0, 1.0, 1.0);
        let derivatives = vec![("A".to_string(), spectra(1.0, 0.0, 0.0))];

        let fisher = cmb_fisher(&fiducial, &derivatives, &experiment(), None).unwrap();
        // 0.5 * (5 + 7 + 9) / 2
        assert_approx_eq!(fisher.get("A", "A").unwrap(), 5.25, 1e-12);
    }

    #[test]
    fn lensing_is_added_as_an_independent_spectrum() {
        let fiducial = spectra(1.0, 1.0, 1.0);
        let derivatives = vec![
            ("A".to_string(), spectra(1.0, 0.0, 1.0)),
            ("B".to_string(), spectra(0.0, 0.0, 2.0)),
        ];
        let noise = LensingNoise::new(vec![0.0, 10.0], vec![1.0, 1.0]).unwrap();

        let fisher = cmb_fisher(&fiducial, &derivatives, &experiment(), Some(&noise)).unwrap();
        assert_approx_eq!(fisher.get("A", "A").unwrap(), 5.25 + 5.25 / 4.0, 1e-12);
        assert_approx_eq!(fisher.get("A", "B").unwrap(), 5.25 / 2.0, 1e-12);
        assert!(fisher.is_symmetric(0.0));

        let mut without_kk = fiducial;
        without_kk.kk = None;
        assert!(cmb_fisher(&without_kk, &derivatives, &experiment(), Some(&noise)).is_err());
    }

    #[test]
    fn spectra_from_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("S4");

        let table = "1,1,0,0\n".repeat(6);
        fs::write(fiducial_file(&root), &table).unwrap();
        fs::write(derivative_file(&root, "A"), "1,0,0,0\n".repeat(6)).unwrap();

        assert!(fiducial_file(&root).ends_with("S4_fCls.csv"));

        let params = vec!["A".to_string()];
        let fisher = fisher_from_files(&root, &params, &experiment(), None).unwrap();
        assert_approx_eq!(fisher.get("A", "A").unwrap(), 5.25, 1e-12);

        let params = vec!["A".to_string(), "H0".to_string()];
        assert!(matches!(
            fisher_from_files(&root, &params, &experiment(), None),
            Err(Error::MissingArtifact { .. })
        ));
    }

    #[test]
    fn lensing_noise_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nlkk.dat");
        fs::write(&path, "# L N_L\n  2  0.5 7\n10   1.5\n\n20 2.5\n").unwrap();

        let noise = LensingNoise::load(&path).unwrap();
        assert_approx_eq!(noise.at(2.0), 0.5, 1e-15);
        assert_approx_eq!(noise.at(15.0), 2.0, 1e-15);
        assert_approx_eq!(noise.at(100.0), 2.5, 1e-15);

        fs::write(&path, "2 0.5\n10\n").unwrap();
        assert!(matches!(LensingNoise::load(&path), Err(Error::Configuration(_))));

        assert!(matches!(
            LensingNoise::load(dir.path().join("missing.dat")),
            Err(Error::MissingArtifact { .. })
        ));
    }
}
