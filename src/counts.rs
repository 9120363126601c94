//! Binned cluster counts on disk: file layout, photo-z rebinning and the finite-difference
//! derivatives the Fisher matrix is built from.
use crate::core::grids::{CountGrid, MassGrid, RedshiftGrid, ScatterGrid};
use crate::core::PowerSpectrumOracle;
use crate::cosmology::{CosmologyParameters, COSMOLOGY_PARAMETER_NAMES};
use crate::error::{Error, Result};
use crate::fisher::{DerivativeSource, ZERO_INFORMATION_PARAMETERS};
use crate::halo::HaloMassFunction;
use crate::sz::{ScalingRelation, SCALING_PARAMETER_NAMES};

use log::{debug, info};
use ndarray::{s, Array3, Axis};
use ndarray_npy::{read_npy, write_npy};
use std::path::{Path, PathBuf};

/// Prefix of the derivative files of `save_id`; the parameter name and `.npy` follow.
pub fn deriv_root(dir: &Path, save_id: &str) -> PathBuf {
    dir.join(format!("dNdp_mzq_{}_", save_id))
}

/// Path of the derivative of the counts of `save_id` with respect to `param`.
pub fn deriv_file(dir: &Path, save_id: &str, param: &str) -> PathBuf {
    dir.join(format!("dNdp_mzq_{}_{}.npy", save_id, param))
}

/// Path of the fiducial counts of `save_id`.
pub fn fid_file(dir: &Path, save_id: &str) -> PathBuf {
    dir.join(format!("N_mzq_{}_fid.npy", save_id))
}

/// Read a (mass, redshift, q) grid from a `.npy` file.
pub fn load_grid<P: AsRef<Path>>(path: P) -> Result<Array3<f64>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::MissingArtifact {
            path: path.to_path_buf(),
        });
    }

    Ok(read_npy(path)?)
}

/// Merge all redshift bins whose upper edge lies at or below `cutoff` into a single bin.
///
/// Returns the new edges and the rebinned grid. With at most one bin below the cutoff the grid is
/// returned unchanged. The total over all bins is conserved.
pub fn rebin_n(grid: &Array3<f64>, cutoff: f64, z_edges: &[f64]) -> Result<(Vec<f64>, Array3<f64>)> {
    let nz = grid.len_of(Axis(1));
    if z_edges.len() != nz + 1 {
        return Err(Error::config(format!(
            "{} redshift edges for a grid with {} redshift bins",
            z_edges.len(),
            nz
        )));
    }

    let merged = z_edges[1..].iter().take_while(|e| **e <= cutoff).count();
    if merged <= 1 {
        return Ok((z_edges.to_vec(), grid.clone()));
    }

    let (nm, _, nq) = grid.dim();
    let mut result = Array3::zeros((nm, nz - merged + 1, nq));

    result
        .index_axis_mut(Axis(1), 0)
        .assign(&grid.slice(s![.., ..merged, ..]).sum_axis(Axis(1)));
    result
        .slice_mut(s![.., 1.., ..])
        .assign(&grid.slice(s![.., merged.., ..]));

    let mut edges = vec![z_edges[0]];
    edges.extend_from_slice(&z_edges[merged..]);

    Ok((edges, result))
}

/// Fail if `grid` holds a NaN or an infinity.
fn check_finite(grid: &Array3<f64>, what: &str) -> Result<()> {
    if grid.iter().any(|v| !v.is_finite()) {
        Err(Error::numerical(format!("non-finite value in {}", what)))
    } else {
        Ok(())
    }
}

/// Counts prepared for the Fisher matrix: rebinned in redshift and scaled to the observed sky.
#[derive(Clone, Debug)]
pub struct CountFiles {
    dir: PathBuf,
    save_id: String,
    z_edges: Vec<f64>,
    photoz_cutoff: f64,
    fsky: f64,
}

impl CountFiles {
    /// The files of `save_id` in `dir`, for a grid with redshift edges `z_edges`.
    pub fn new(
        dir: &Path,
        save_id: &str,
        z_edges: Vec<f64>,
        photoz_cutoff: f64,
        fsky: f64,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            save_id: save_id.to_string(),
            z_edges,
            photoz_cutoff,
            fsky,
        }
    }

    fn prepare(&self, path: &Path) -> Result<Array3<f64>> {
        let (_, grid) = rebin_n(&load_grid(path)?, self.photoz_cutoff, &self.z_edges)?;
        let grid = grid * self.fsky;
        check_finite(&grid, &path.display().to_string())?;

        Ok(grid)
    }

    /// The fiducial counts; negative counts are rejected.
    pub fn fiducial(&self) -> Result<CountGrid> {
        CountGrid::new(self.prepare(&fid_file(&self.dir, &self.save_id))?)
    }
}

impl DerivativeSource for CountFiles {
    fn derivative(&self, param: &str) -> Result<Array3<f64>> {
        debug_assert!(!ZERO_INFORMATION_PARAMETERS.contains(&param));
        self.prepare(&deriv_file(&self.dir, &self.save_id, param))
    }
}

/// The SZ-selected counts of a survey as a function of the cosmological and scaling-relation
/// parameters.
pub struct CountModel<'a, O: ?Sized> {
    oracle: &'a O,
    cosmology: CosmologyParameters,
    relation: ScalingRelation,
    mass_grid: &'a MassGrid,
    z_grid: &'a RedshiftGrid,
    q_edges: &'a [f64],
    scatter: &'a ScatterGrid,
}

impl<'a, O> CountModel<'a, O>
where
    O: PowerSpectrumOracle + ?Sized,
{
    /// Constructor.
    pub fn new(
        oracle: &'a O,
        cosmology: CosmologyParameters,
        relation: ScalingRelation,
        mass_grid: &'a MassGrid,
        z_grid: &'a RedshiftGrid,
        q_edges: &'a [f64],
        scatter: &'a ScatterGrid,
    ) -> Self {
        Self {
            oracle,
            cosmology,
            relation,
            mass_grid,
            z_grid,
            q_edges,
            scatter,
        }
    }

    fn counts(&self, cosmology: CosmologyParameters, relation: &ScalingRelation) -> Result<Array3<f64>> {
        HaloMassFunction::new(cosmology, self.oracle).n_of_mzq_sz(
            self.mass_grid,
            self.z_grid,
            self.q_edges,
            relation,
            self.scatter,
        )
    }

    /// Full-sky counts at the fiducial parameters.
    pub fn fiducial(&self) -> Result<Array3<f64>> {
        self.counts(self.cosmology, &self.relation)
    }

    /// Full-sky counts with the parameter `name` shifted by `delta`.
    pub fn counts_at(&self, name: &str, delta: f64) -> Result<Array3<f64>> {
        if COSMOLOGY_PARAMETER_NAMES.contains(&name) {
            self.counts(self.cosmology.with_offset(name, delta)?, &self.relation)
        } else if SCALING_PARAMETER_NAMES.contains(&name) {
            self.counts(self.cosmology, &self.relation.with_offset(name, delta)?)
        } else {
            Err(Error::config(format!(
                "the cluster counts do not depend on `{}`",
                name
            )))
        }
    }

    /// Central difference $[N(p + h) - N(p - h)] / 2h$.
    pub fn derivative(&self, name: &str, step: f64) -> Result<Array3<f64>> {
        if !(step > 0.0) {
            return Err(Error::config(format!(
                "finite-difference step of `{}` must be positive",
                name
            )));
        }

        let upper = self.counts_at(name, step)?;
        let lower = self.counts_at(name, -step)?;

        Ok((upper - lower) / (2.0 * step))
    }

    /// Write the fiducial counts and the derivatives with respect to `steps` (name, step) as the
    /// `.npy` files [`CountFiles`] reads.
    pub fn write_derivatives(&self, dir: &Path, save_id: &str, steps: &[(String, f64)]) -> Result<()> {
        let fiducial = self.fiducial()?;
        info!("fiducial clusters on the full sky: {:.1}", fiducial.sum());
        write_npy(fid_file(dir, save_id), &fiducial)?;

        for (name, step) in steps {
            if ZERO_INFORMATION_PARAMETERS.contains(&name.as_str()) {
                debug!("skipping derivative with respect to `{}`", name);
                continue;
            }

            let derivative = self.derivative(name, *step)?;
            write_npy(deriv_file(dir, save_id, name), &derivative)?;
            debug!("wrote derivative with respect to `{}`", name);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fisher::{get_fisher, PriorSet};
    use crate::oracle::FlatLcdmOracle;
    use ndarray::Array3;
    use rand::Rng;
    use rand_pcg::Pcg64;
    use tempfile::tempdir;

    #[test]
    fn file_names() {
        let dir = Path::new("/data");
        assert_eq!(
            fid_file(dir, "S4_grid_owl2_v1.0"),
            Path::new("/data/N_mzq_S4_grid_owl2_v1.0_fid.npy")
        );
        assert_eq!(
            deriv_file(dir, "S4_grid_owl2_v1.0", "H0"),
            Path::new("/data/dNdp_mzq_S4_grid_owl2_v1.0_H0.npy")
        );
        assert_eq!(
            deriv_root(dir, "S4_grid_owl2_v1.0"),
            Path::new("/data/dNdp_mzq_S4_grid_owl2_v1.0_")
        );
    }

    #[test]
    fn rebinning_conserves_the_total() {
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96);
        let grid = Array3::from_shape_fn((3, 5, 2), |_| rng.gen_range(0.0, 10.0));
        let z_edges = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5];

        let (edges, rebinned) = rebin_n(&grid, 1.2, &z_edges).unwrap();
        assert_eq!(edges, vec![0.0, 1.0, 1.5, 2.0, 2.5]);
        assert_eq!(rebinned.dim(), (3, 4, 2));
        assert!((rebinned.sum() - grid.sum()).abs() < 1e-10);
        assert_eq!(rebinned[[1, 3, 1]], grid[[1, 4, 1]]);
        assert!((rebinned[[2, 0, 0]] - grid[[2, 0, 0]] - grid[[2, 1, 0]]).abs() < 1e-12);
    }

    #[test]
    fn single_bin_below_the_cutoff_is_kept() {
        let grid = Array3::from_elem((1, 3, 1), 1.0);
        let z_edges = [0.0, 0.5, 1.0, 1.5];

        let (edges, rebinned) = rebin_n(&grid, 0.7, &z_edges).unwrap();
        assert_eq!(edges, z_edges.to_vec());
        assert_eq!(rebinned, grid);

        assert!(rebin_n(&grid, 0.7, &[0.0, 1.0]).is_err());
    }

    #[test]
    fn prepared_files_are_rebinned_and_scaled() {
        let dir = tempdir().unwrap();
        let fid = Array3::from_elem((2, 3, 1), 4.0);
        write_npy(fid_file(dir.path(), "id"), &fid).unwrap();
        write_npy(deriv_file(dir.path(), "id", "s8"), &(&fid * -1.0)).unwrap();

        let files = CountFiles::new(dir.path(), "id", vec![0.0, 0.5, 1.0, 1.5], 1.0, 0.5);

        let n = files.fiducial().unwrap();
        assert_eq!(n.counts().dim(), (2, 2, 1));
        assert_eq!(n.counts()[[0, 0, 0]], 4.0);
        assert_eq!(n.counts()[[0, 1, 0]], 2.0);

        let dn = files.derivative("s8").unwrap();
        assert_eq!(dn[[1, 0, 0]], -4.0);

        assert!(matches!(
            files.derivative("H0"),
            Err(Error::MissingArtifact { .. })
        ));
    }

    #[test]
    fn negative_fiducial_counts_are_fatal() {
        let dir = tempdir().unwrap();
        let mut fid = Array3::from_elem((1, 2, 1), 1.0);
        fid[[0, 1, 0]] = -1.0;
        write_npy(fid_file(dir.path(), "id"), &fid).unwrap();

        let files = CountFiles::new(dir.path(), "id", vec![0.0, 0.5, 1.0], 0.0, 1.0);
        assert!(matches!(
            files.fiducial(),
            Err(Error::NumericalInstability(_))
        ));
    }

    #[test]
    fn non_finite_grids_are_fatal_after_rebinning() {
        let dir = tempdir().unwrap();
        let z_edges = vec![0.0, 0.5, 1.0, 1.5];
        let files = CountFiles::new(dir.path(), "id", z_edges, 1.0, 0.5);

        write_npy(fid_file(dir.path(), "id"), &Array3::from_elem((2, 3, 1), 4.0)).unwrap();
        assert!(files.fiducial().is_ok());

        for (i, &bad) in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY].iter().enumerate() {
            let mut grid = Array3::from_elem((2, 3, 1), 1.0);
            // inside the merged bins and behind them
            grid[[1, i % 2, 0]] = bad;
            grid[[0, 2, 0]] = bad;
            write_npy(deriv_file(dir.path(), "id", "s8"), &grid).unwrap();

            assert!(matches!(
                files.derivative("s8"),
                Err(Error::NumericalInstability(_))
            ));
        }

        let mut fid = Array3::from_elem((2, 3, 1), 4.0);
        fid[[0, 2, 0]] = f64::INFINITY;
        write_npy(fid_file(dir.path(), "id"), &fid).unwrap();
        assert!(matches!(
            files.fiducial(),
            Err(Error::NumericalInstability(_))
        ));
    }

    fn survey() -> (MassGrid, RedshiftGrid, Vec<f64>, ScatterGrid) {
        let mass_grid = MassGrid::new(vec![14.0, 14.5, 15.0]).unwrap();
        let z_grid = RedshiftGrid::new(vec![0.1, 0.5, 1.0]).unwrap();
        let scatter = ScatterGrid {
            mgrid: mass_grid.centers(),
            zgrid: z_grid.centers(),
            siggrid: ndarray::Array2::from_elem((2, 2), 2e-12),
        };

        (mass_grid, z_grid, vec![5.0, 10.0, 1e4], scatter)
    }

    #[test]
    fn central_differences_of_the_counts() {
        let oracle = FlatLcdmOracle::default();
        let (mass_grid, z_grid, q_edges, scatter) = survey();
        let model = CountModel::new(
            &oracle,
            CosmologyParameters::default(),
            ScalingRelation::default(),
            &mass_grid,
            &z_grid,
            &q_edges,
            &scatter,
        );

        let fiducial = model.fiducial().unwrap();
        assert!(fiducial.sum() > 0.0);

        // more structure and brighter clusters both mean more detections
        let step = 0.005;
        let d_s8 = model.derivative("s8", step).unwrap();
        assert_eq!(d_s8.dim(), (2, 2, 2));
        assert!(d_s8.sum() > 0.0);

        let forward = (model.counts_at("s8", step).unwrap() - &fiducial) / step;
        assert!((forward.sum() / d_s8.sum() - 1.0).abs() < 0.1);

        let d_ystar = model.derivative("Y_star", 1e-11).unwrap();
        assert!(d_ystar.sum() > 0.0);

        assert!(matches!(model.derivative("sigR", 0.1), Err(Error::Configuration(_))));
        assert!(matches!(model.derivative("s8", 0.0), Err(Error::Configuration(_))));
    }

    #[test]
    fn written_derivatives_are_read_back() {
        let dir = tempdir().unwrap();
        let oracle = FlatLcdmOracle::default();
        let (mass_grid, z_grid, q_edges, scatter) = survey();
        let model = CountModel::new(
            &oracle,
            CosmologyParameters::default(),
            ScalingRelation::default(),
            &mass_grid,
            &z_grid,
            &q_edges,
            &scatter,
        );

        let steps = vec![("s8".to_string(), 0.005), ("tau".to_string(), 0.01)];
        model.write_derivatives(dir.path(), "id", &steps).unwrap();

        assert!(fid_file(dir.path(), "id").exists());
        assert!(deriv_file(dir.path(), "id", "s8").exists());
        assert!(!deriv_file(dir.path(), "id", "tau").exists());

        let files = CountFiles::new(dir.path(), "id", z_grid.edges().to_vec(), 0.0, 0.5);
        let fiducial = files.fiducial().unwrap();
        assert!((fiducial.total() - 0.5 * model.fiducial().unwrap().sum()).abs() < 1e-9);

        let expected = model.derivative("s8", 0.005).unwrap() * 0.5;
        let read = files.derivative("s8").unwrap();
        assert!(read.iter().zip(expected.iter()).all(|(a, b)| (a - b).abs() <= 1e-12 * b.abs()));

        let params = vec!["s8".to_string(), "tau".to_string()];
        let fisher = get_fisher(&fiducial, &params, &PriorSet::new(), &files).unwrap();
        assert!(fisher.get("s8", "s8").unwrap() > 0.0);
        assert_eq!(fisher.get("tau", "tau"), Some(0.0));
    }
}
