//! Physical constants and the cosmological parameters of a forecast.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Physical constants in CGS units.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Constants {
    /// Gravitational constant $G$.
    pub g_cgs: f64,
    /// Solar mass in grams.
    pub msun_cgs: f64,
    /// One megaparsec in centimetres.
    pub mpc2cm: f64,
    /// Thomson cross-section $\sigma_T$.
    pub sigma_t: f64,
    /// Electron mass.
    pub me: f64,
    /// Speed of light in cm/s.
    pub c: f64,
    /// Boltzmann constant.
    pub k_cgs: f64,
    /// Planck constant.
    pub h_cgs: f64,
    /// CMB temperature in Kelvin.
    pub tcmb: f64,
    /// Electronvolt in erg.
    pub ev_2_erg: f64,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            g_cgs: 6.67259e-08,
            msun_cgs: 1.98900e+33,
            mpc2cm: 3.085678e+24,
            sigma_t: 6.65246e-25,
            me: 9.10939e-28,
            c: 2.99792e+10,
            k_cgs: 1.3806488e-16,
            h_cgs: 6.62608e-27,
            tcmb: 2.726,
            ev_2_erg: 1.60217662e-12,
        }
    }
}

impl Constants {
    /// CMB temperature in micro-Kelvin.
    pub fn tcmb_muk(&self) -> f64 {
        self.tcmb * 1.0e6
    }

    /// Speed of light in km/s.
    pub fn c_km_s(&self) -> f64 {
        self.c * 1.0e-5
    }
}

/// Named parameter sets that fix every cosmological parameter at once.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum Preset {
    /// WMAP9, the default.
    Wmap9,
    /// Planck 2015.
    Planck15,
    /// Cosmology used for the calibration of the Tinker mass function.
    Tinker,
    /// High-$\sigma_8$ cosmology with a large optical depth.
    Jb,
}

/// The cosmological parameters around which the forecast is computed.
///
/// Instances are never mutated: finite differences go through
/// [`CosmologyParameters::with_offset`], which returns a new record.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CosmologyParameters {
    /// Hubble constant in km/s/Mpc.
    pub h0: f64,
    /// Total matter density $\Omega_m$.
    pub om: f64,
    /// Baryon density $\Omega_b$.
    pub ob: f64,
    /// Dark-energy density $\Omega_\Lambda$.
    pub ol: f64,
    /// Amplitude of fluctuations $\sigma_8$ today.
    pub s8: f64,
    /// Scalar spectral index.
    pub ns: f64,
    /// Optical depth to reionization.
    pub tau: f64,
    /// Sum of neutrino masses in eV.
    pub mnu: f64,
    /// Tensor-to-scalar ratio.
    pub r: f64,
    /// Physical constants.
    #[serde(default)]
    pub constants: Constants,
}

impl Default for CosmologyParameters {
    fn default() -> Self {
        Self::preset(Preset::Wmap9, Constants::default())
    }
}

/// Names accepted by [`CosmologyParameters::value`] and [`CosmologyParameters::with_offset`].
pub const COSMOLOGY_PARAMETER_NAMES: [&str; 9] =
    ["H0", "om", "ob", "ol", "s8", "ns", "tau", "mnu", "r"];

impl CosmologyParameters {
    /// Parameters of the given preset.
    pub fn preset(preset: Preset, constants: Constants) -> Self {
        let (h0, om, ob, ol, s8, ns, tau) = match preset {
            Preset::Wmap9 => (70.0, 0.279, 0.0463, 0.721, 0.821, 0.972, 0.08),
            Preset::Planck15 => (67.31, 0.315, 0.04904, 0.685, 0.829, 0.9655, 0.08),
            Preset::Tinker => (70.0, 0.30, 0.04, 0.70, 0.9, 1.0, 0.08),
            Preset::Jb => (70.0, 0.30, 0.04, 0.70, 0.98, 1.0, 0.17),
        };

        Self {
            h0,
            om,
            ob,
            ol,
            s8,
            ns,
            tau,
            mnu: 0.0,
            r: 0.0,
            constants,
        }
    }

    /// Dimensionless Hubble parameter $h = H_0 / (100\,\mathrm{km/s/Mpc})$.
    pub fn h(&self) -> f64 {
        self.h0 / 100.0
    }

    /// Curvature density $\Omega_k = 1 - \Omega_m - \Omega_\Lambda$.
    pub fn ok(&self) -> f64 {
        1.0 - self.om - self.ol
    }

    /// Critical density today in $h^2 M_\odot / \mathrm{Mpc}^3$.
    pub fn rho_crit0(&self) -> f64 {
        let c = &self.constants;
        3.0 / (8.0 * PI) * (100.0 * 1e5_f64).powi(2) / c.g_cgs * c.mpc2cm / c.msun_cgs
    }

    /// Mean matter density today, $\Omega_m \rho_{c,0}$.
    pub fn rho_mean0(&self) -> f64 {
        self.rho_crit0() * self.om
    }

    /// Dimensionless expansion rate $E(z) = H(z) / H_0$.
    pub fn e_z(&self, z: f64) -> f64 {
        let a = 1.0 + z;
        (self.om * a.powi(3) + self.ok() * a.powi(2) + self.ol).sqrt()
    }

    /// Critical density at redshift `z`.
    pub fn rho_crit(&self, z: f64) -> f64 {
        self.rho_crit0() * self.e_z(z).powi(2)
    }

    /// Mean matter density at redshift `z`.
    pub fn rho_mean(&self, z: f64) -> f64 {
        self.rho_mean0() * (1.0 + z).powi(3)
    }

    /// Returns the value of the parameter called `name`.
    pub fn value(&self, name: &str) -> Result<f64> {
        Ok(match name {
            "H0" => self.h0,
            "om" => self.om,
            "ob" => self.ob,
            "ol" => self.ol,
            "s8" => self.s8,
            "ns" => self.ns,
            "tau" => self.tau,
            "mnu" => self.mnu,
            "r" => self.r,
            _ => {
                return Err(Error::config(format!(
                    "`{}` is not a cosmological parameter",
                    name
                )))
            }
        })
    }

    /// Returns a copy with the parameter `name` shifted by `delta`.
    pub fn with_offset(&self, name: &str, delta: f64) -> Result<Self> {
        let mut shifted = *self;
        let slot = match name {
            "H0" => &mut shifted.h0,
            "om" => &mut shifted.om,
            "ob" => &mut shifted.ob,
            "ol" => &mut shifted.ol,
            "s8" => &mut shifted.s8,
            "ns" => &mut shifted.ns,
            "tau" => &mut shifted.tau,
            "mnu" => &mut shifted.mnu,
            "r" => &mut shifted.r,
            _ => {
                return Err(Error::config(format!(
                    "`{}` is not a cosmological parameter",
                    name
                )))
            }
        };
        *slot += delta;
        Ok(shifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn critical_density() {
        let cp = CosmologyParameters::default();
        // 2.775e11 h^2 M_sun / Mpc^3
        assert_approx_eq!(cp.rho_crit0() / 1e11, 2.775, 1e-3);
    }

    #[test]
    fn expansion_rate_today_is_one() {
        let cp = CosmologyParameters::preset(Preset::Planck15, Constants::default());
        assert_approx_eq!(cp.e_z(0.0), 1.0, 1e-12);
        assert!(cp.e_z(1.0) > 1.0);
    }

    #[test]
    fn offsets_do_not_touch_the_original() {
        let cp = CosmologyParameters::default();
        let shifted = cp.with_offset("s8", 0.01).unwrap();

        assert_approx_eq!(shifted.s8 - cp.s8, 0.01, 1e-15);
        assert_eq!(shifted.h0, cp.h0);
        assert_eq!(cp.value("s8").unwrap(), 0.821);
        assert!(cp.with_offset("w", 0.1).is_err());
    }
}
