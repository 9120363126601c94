//! A self-contained power spectrum backend.
//!
//! [`FlatLcdmOracle`] replaces the Boltzmann code by the Eisenstein & Hu (1998) no-wiggle transfer
//! function, the Carroll, Press & Turner (1992) growth factor and numerically integrated
//! distances. It is accurate to a few percent for $\Lambda$CDM, ignores massive neutrinos and is
//! mostly useful for tests and quick forecasts; production runs inject a tabulated backend.
use crate::core::{MatterPower, PowerSpectrumOracle};
use crate::cosmology::CosmologyParameters;
use crate::error::{Error, Result};
use crate::halo::sigma_squared;
use crate::integrators::trapezoid;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::f64::consts::E;

/// Analytic $\Lambda$CDM backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlatLcdmOracle {
    /// Smallest wavenumber in $h/\mathrm{Mpc}$.
    pub k_min: f64,
    /// Largest wavenumber in $h/\mathrm{Mpc}$.
    pub k_max: f64,
    /// Number of log-spaced wavenumbers.
    pub k_points: usize,
    /// Integration steps per unit redshift for the comoving distance.
    pub distance_steps_per_z: usize,
}

impl Default for FlatLcdmOracle {
    fn default() -> Self {
        Self {
            k_min: 2e-5,
            k_max: 11.0,
            k_points: 200,
            distance_steps_per_z: 1000,
        }
    }
}

impl FlatLcdmOracle {
    fn wavenumbers(&self) -> Array1<f64> {
        Array1::logspace(10.0, self.k_min.log10(), self.k_max.log10(), self.k_points)
    }

    /// The no-wiggle transfer function, `k` in $h/\mathrm{Mpc}$.
    pub fn transfer(&self, cosmology: &CosmologyParameters, k: f64) -> f64 {
        let h = cosmology.h();
        let theta = cosmology.constants.tcmb / 2.7;
        let om_h2 = cosmology.om * h * h;
        let ob_h2 = cosmology.ob * h * h;
        let fb = cosmology.ob / cosmology.om;

        let s = 44.5 * (9.83 / om_h2).ln() / (1.0 + 10.0 * ob_h2.powf(0.75)).sqrt();
        let alpha = 1.0 - 0.328 * (431.0 * om_h2).ln() * fb + 0.38 * (22.3 * om_h2).ln() * fb * fb;
        let gamma =
            cosmology.om * h * (alpha + (1.0 - alpha) / (1.0 + (0.43 * k * h * s).powi(4)));

        let q = k * theta * theta / gamma;
        let l0 = (2.0 * E + 1.8 * q).ln();
        let c0 = 14.2 + 731.0 / (1.0 + 62.5 * q);

        l0 / (l0 + c0 * q * q)
    }

    /// Linear growth factor normalized to unity today.
    pub fn growth(&self, cosmology: &CosmologyParameters, z: f64) -> f64 {
        let g = |z: f64| {
            let e2 = cosmology.e_z(z).powi(2);
            let om = cosmology.om * (1.0 + z).powi(3) / e2;
            let ol = cosmology.ol / e2;
            2.5 * om / (om.powf(4.0 / 7.0) - ol + (1.0 + om / 2.0) * (1.0 + ol / 70.0))
        };

        g(z) / (1.0 + z) / g(0.0)
    }

    /// Line-of-sight comoving distance in Mpc.
    fn comoving_distance(&self, cosmology: &CosmologyParameters, z: f64) -> f64 {
        if z <= 0.0 {
            return 0.0;
        }

        let steps = ((z * self.distance_steps_per_z as f64).ceil() as usize).max(16);
        let zs: Vec<f64> = (0..=steps).map(|i| z * i as f64 / steps as f64).collect();
        let inv_e: Vec<f64> = zs.iter().map(|z| 1.0 / cosmology.e_z(*z)).collect();

        cosmology.constants.c_km_s() / cosmology.h0 * trapezoid(&zs, &inv_e)
    }
}

impl PowerSpectrumOracle for FlatLcdmOracle {
    fn matter_power(
        &self,
        cosmology: &CosmologyParameters,
        redshifts: &[f64],
    ) -> Result<MatterPower> {
        if !(cosmology.om > 0.0 && cosmology.ob >= 0.0 && cosmology.ob < cosmology.om) {
            return Err(Error::numerical(format!(
                "unphysical densities om = {}, ob = {}",
                cosmology.om, cosmology.ob
            )));
        }

        let k = self.wavenumbers();
        let shape: Array1<f64> = k
            .iter()
            .map(|&k| k.powf(cosmology.ns) * self.transfer(cosmology, k).powi(2))
            .collect();

        // normalize to sigma8 today
        let norm = cosmology.s8.powi(2) / sigma_squared(k.as_slice().unwrap_or(&[]), shape.view(), 8.0);

        let mut pk = Array2::zeros((redshifts.len(), k.len()));
        let mut sigma8 = Array1::zeros(redshifts.len());

        for (i, &z) in redshifts.iter().enumerate() {
            let d = self.growth(cosmology, z);
            pk.row_mut(i).assign(&(&shape * (norm * d * d)));
            sigma8[i] = cosmology.s8 * d;
        }

        Ok(MatterPower { k, pk, sigma8 })
    }

    fn angular_diameter_distance(&self, cosmology: &CosmologyParameters, z: f64) -> Result<f64> {
        let chi = self.comoving_distance(cosmology, z);
        let ok = cosmology.ok();
        let dh = cosmology.constants.c_km_s() / cosmology.h0;

        let dm = if ok > 1e-8 {
            dh / ok.sqrt() * (ok.sqrt() * chi / dh).sinh()
        } else if ok < -1e-8 {
            dh / (-ok).sqrt() * ((-ok).sqrt() * chi / dh).sin()
        } else {
            chi
        };

        Ok(dm / (1.0 + z))
    }

    fn hubble_rate(&self, cosmology: &CosmologyParameters, z: f64) -> Result<f64> {
        Ok(cosmology.h0 * cosmology.e_z(z))
    }
}
