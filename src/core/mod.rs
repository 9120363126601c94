//! Core abstractions. You don't need to import this module since all its public members are part
//! of the crate namespace.
pub mod grids;

use crate::cosmology::CosmologyParameters;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2};

/// The linear matter power spectrum on a grid of wavenumbers and redshifts, as returned by a
/// [`PowerSpectrumOracle`].
#[derive(Clone, Debug)]
pub struct MatterPower {
    /// Wavenumbers $k$ in $h/\mathrm{Mpc}$, increasing.
    pub k: Array1<f64>,
    /// $P(k, z)$ in $(\mathrm{Mpc}/h)^3$; row `i` belongs to the `i`-th requested redshift.
    pub pk: Array2<f64>,
    /// $\sigma_8(z)$ computed by the backend, in the order of the requested redshifts.
    pub sigma8: Array1<f64>,
}

impl MatterPower {
    /// Make sure the backend answered for all `redshifts` and that every entry is finite.
    pub fn check(&self, redshifts: &[f64]) -> Result<()> {
        if self.pk.nrows() < redshifts.len() || self.sigma8.len() < redshifts.len() {
            return Err(Error::numerical(format!(
                "power spectrum backend returned {} rows for {} redshifts",
                self.pk.nrows(),
                redshifts.len()
            )));
        }

        if self.pk.ncols() != self.k.len() {
            return Err(Error::numerical(format!(
                "power spectrum has {} columns but {} wavenumbers",
                self.pk.ncols(),
                self.k.len()
            )));
        }

        if self.pk.iter().chain(self.sigma8.iter()).any(|v| !v.is_finite()) {
            return Err(Error::numerical("non-finite P(k) or sigma8 from backend"));
        }

        Ok(())
    }
}

/// Boltzmann-code backend used as a black box for the matter power spectrum and the background
/// expansion.
pub trait PowerSpectrumOracle: Send + Sync {
    /// The linear matter power spectrum at the given `redshifts`.
    fn matter_power(&self, cosmology: &CosmologyParameters, redshifts: &[f64])
        -> Result<MatterPower>;

    /// Angular-diameter distance to redshift `z` in Mpc.
    fn angular_diameter_distance(&self, cosmology: &CosmologyParameters, z: f64) -> Result<f64>;

    /// Hubble rate $H(z)$ in km/s/Mpc.
    fn hubble_rate(&self, cosmology: &CosmologyParameters, z: f64) -> Result<f64>;
}

/// Compute the number of forecast units a given worker processes, given the total number of
/// workers `n_cores`, the index `core` (zero-based) of the current worker as well as the total
/// number of units `total_units` to process combined on all workers.
pub(crate) fn compute_units_for_core(core: usize, n_cores: usize, total_units: usize) -> usize {
    debug_assert!(core < n_cores);
    let units_per_core = (total_units + n_cores - 1) / n_cores;

    // the last workers may be left with fewer units, or none at all
    total_units
        .saturating_sub(core * units_per_core)
        .min(units_per_core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_units_per_core_simple() {
        let n_cores = 3;
        let total_units = 17;
        let units_per_core = (0..n_cores)
            .map(|core| compute_units_for_core(core, n_cores, total_units))
            .collect::<Vec<_>>();

        assert_eq!(units_per_core[0], 6);
        assert_eq!(units_per_core[1], 6);
        assert_eq!(units_per_core[2], 5);
        assert_eq!(total_units, units_per_core.into_iter().sum::<usize>());
    }

    #[test]
    fn test_units_per_core_more_cores_than_units() {
        let n_cores = 8;
        let total_units = 3;
        let total_units_check: usize = (0..n_cores)
            .map(|core| compute_units_for_core(core, n_cores, total_units))
            .sum();
        assert_eq!(total_units, total_units_check);
        assert_eq!(compute_units_for_core(7, n_cores, total_units), 0);
    }

    #[test]
    fn missing_redshift_rows_are_fatal() {
        let power = MatterPower {
            k: array![0.1, 1.0],
            pk: array![[1.0, 2.0]],
            sigma8: array![0.8],
        };

        assert!(power.check(&[0.0]).is_ok());
        assert!(matches!(
            power.check(&[0.0, 1.0]),
            Err(Error::NumericalInstability(_))
        ));
    }

    #[test]
    fn non_finite_power_is_fatal() {
        let power = MatterPower {
            k: array![0.1, 1.0],
            pk: array![[1.0, f64::NAN]],
            sigma8: array![0.8],
        };

        assert!(power.check(&[0.0]).is_err());
    }
}
