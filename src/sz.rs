//! The thermal SZ observable of a cluster.
//!
//! A cluster of mass $M_{500c}$ at redshift $z$ is described by a generalized NFW (GNFW) pressure
//! profile
//!
//! $$ P(r) = P_{500}(M, z)\, \frac{P_0}{(c x)^\gamma \left[1 + (c x)^\alpha\right]^{(\beta -
//! \gamma)/\alpha}}, \qquad x = r / R_{500}, $$
//!
//! which is projected along the line of sight into a Compton-$y$ map, Hankel transformed, and
//! combined with the noise power spectrum into the variance of a matched filter. All integrals are
//! fixed-step sums with tunable steps, see [`ProfileSettings`] and [`FilterSettings`].
use crate::core::grids::{MassGrid, RedshiftGrid, ScatterGrid};
use crate::core::PowerSpectrumOracle;
use crate::cosmology::{Constants, CosmologyParameters};
use crate::error::{Error, Result};
use crate::halo::rdel_c;
use crate::integrators::riemann::{integrate_checked, RiemannEstimators, UniformRule};
use crate::noise::NoiseSpectrum;

use log::debug;
use ndarray::Array2;
use scilib::math::bessel;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;
use std::f64::consts::{PI, SQRT_2};

/// Functional form of the pressure profile.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProfileModel {
    /// Arnaud et al. (2010) universal pressure profile.
    Arnaud,
    /// Battaglia, Bond, Pfrommer & Sievers (2012):
    /// $P_0 (x/x_c)^\gamma / [1 + (x/x_c)^\alpha]^\beta$.
    Bbps,
}

/// Shape parameters of a GNFW profile.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GnfwParameters {
    /// Functional form
    pub model: ProfileModel,
    /// Normalization $P_0$.
    pub p0: f64,
    /// Concentration $x_c$.
    pub xc: f64,
    /// Intermediate slope $\alpha$.
    pub alpha: f64,
    /// Inner slope $\gamma$.
    pub gamma: f64,
    /// Outer slope $\beta$.
    pub beta: f64,
}

impl Default for GnfwParameters {
    fn default() -> Self {
        Self::preset(ProfileModel::Arnaud)
    }
}

impl GnfwParameters {
    /// The published best-fit parameters of `model`.
    pub fn preset(model: ProfileModel) -> Self {
        match model {
            ProfileModel::Arnaud => Self {
                model,
                p0: 8.403,
                xc: 1.177,
                alpha: 1.05,
                gamma: 0.31,
                beta: 5.49,
            },
            ProfileModel::Bbps => Self {
                model,
                p0: 7.49,
                xc: 0.710,
                alpha: 1.0,
                gamma: -0.3,
                beta: 4.19,
            },
        }
    }

    /// Dimensionless pressure at $x = r / R_{500}$.
    pub fn evaluate(&self, x: f64) -> f64 {
        match self.model {
            ProfileModel::Arnaud => {
                let cx = x * self.xc;
                self.p0
                    / (cx.powf(self.gamma)
                        * (1.0 + cx.powf(self.alpha)).powf((self.beta - self.gamma) / self.alpha))
            }
            ProfileModel::Bbps => {
                let xr = x / self.xc;
                self.p0 * xr.powf(self.gamma) / (1.0 + xr.powf(self.alpha)).powf(self.beta)
            }
        }
    }
}

/// Radial sampling of the pressure profile and the line-of-sight projection.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Spacing of the tabulated profile in $h^{-1}\,\mathrm{Mpc}$; the table starts at this value.
    pub table_step: f64,
    /// The table covers radii strictly below this value.
    pub table_max: f64,
    /// Step of the line-of-sight sum.
    pub los_step: f64,
    /// Number of line-of-sight samples.
    pub los_samples: usize,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            table_step: 1e-4,
            table_max: 100.0,
            los_step: 1e-4,
            los_samples: 100_000,
        }
    }
}

/// Multipole and angular sampling of the matched filter.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct FilterSettings {
    /// First multipole
    pub ell_min: f64,
    /// Multipoles stay strictly below this value.
    pub ell_max: f64,
    /// Multipole step
    pub ell_step: f64,
    /// Angular step of the Hankel transform in radians.
    pub hankel_step: f64,
    /// The Hankel transform extends to this many core radii $\theta_c$.
    pub hankel_extent: f64,
    /// Angular step of the real-space profile integral in radians.
    pub real_step: f64,
    /// The real-space integral extends to this many core radii.
    pub real_extent: f64,
    /// Observing frequency in GHz.
    pub frequency_ghz: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            ell_min: 2.0,
            ell_max: 60_000.0,
            ell_step: 100.0,
            hankel_step: 1e-5,
            hankel_extent: 25.0,
            real_step: 2.5e-6,
            real_extent: 5.0,
            frequency_ghz: 150.0,
        }
    }
}

/// Non-relativistic tSZ spectral function $f(\nu) = x \coth(x/2) - 4$ with
/// $x = h\nu / k_B T_\mathrm{CMB}$, `nu` in GHz.
pub fn f_nu(constants: &Constants, nu: f64) -> f64 {
    let mu = constants.h_cgs * (1e9 * nu) / (constants.k_cgs * constants.tcmb);
    mu / (mu / 2.0).tanh() - 4.0
}

/// Pressure profile tabulated on a uniform radial grid and linearly interpolated in between.
#[derive(Clone, Debug)]
pub struct ProfileTable {
    rule: UniformRule<f64>,
    values: Vec<f64>,
}

impl ProfileTable {
    /// Tabulate `profile` at `step, 2 step, ...` strictly below `max`.
    pub fn new<F: Fn(f64) -> f64>(profile: F, step: f64, max: f64) -> Result<Self> {
        let rule = UniformRule::from_range(step, max, step);
        if rule.samples() < 2 {
            return Err(Error::config(format!(
                "profile table with step {} and maximum {} has fewer than two points",
                step, max
            )));
        }

        let values = rule.points().map(profile).collect();
        Ok(Self { rule, values })
    }

    /// Number of tabulated radii.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the table is empty; never true for a constructed table.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Interpolated value at `r`, or NaN outside of the tabulated range.
    pub fn at(&self, r: f64) -> f64 {
        let x = (r - self.rule.point(0)) / self.rule.step();
        let last = (self.values.len() - 1) as f64;

        if !(x >= 0.0 && x <= last) {
            return f64::NAN;
        }

        let lower = (x.floor() as usize).min(self.values.len() - 2);
        let t = x - lower as f64;

        self.values[lower] + t * (self.values[lower + 1] - self.values[lower])
    }
}

/// Projected SZ signal and matched-filter noise of a single cluster.
///
/// The radial profile is tabulated once on construction and reused by every projection of the
/// same model.
#[derive(Clone, Debug)]
pub struct SzClusterModel {
    cosmology: CosmologyParameters,
    gnfw: GnfwParameters,
    mass: f64,
    z: f64,
    r500: f64,
    settings: ProfileSettings,
    table: ProfileTable,
}

impl SzClusterModel {
    /// A cluster of mass `mass` ($M_{500c}$ in $h^{-1} M_\odot$) at redshift `z`.
    pub fn new(
        cosmology: CosmologyParameters,
        gnfw: GnfwParameters,
        mass: f64,
        z: f64,
        settings: ProfileSettings,
    ) -> Result<Self> {
        if !(mass > 0.0) || !(z >= 0.0) {
            return Err(Error::config(format!(
                "invalid cluster with M = {:e} at z = {}",
                mass, z
            )));
        }

        let r500 = rdel_c(&cosmology, mass, z, 500.0);
        let p500 = pressure_500(&cosmology, mass, z);
        let table = ProfileTable::new(
            |r| p500 * gnfw.evaluate(r / r500),
            settings.table_step,
            settings.table_max,
        )?;

        Ok(Self {
            cosmology,
            gnfw,
            mass,
            z,
            r500,
            settings,
            table,
        })
    }

    /// $R_{500c}$ in $h^{-1}\,\mathrm{Mpc}$.
    pub fn r500(&self) -> f64 {
        self.r500
    }

    /// Mass of the cluster
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Redshift of the cluster
    pub fn z(&self) -> f64 {
        self.z
    }

    /// Electron pressure at radius `r` in $\mathrm{keV}\,\mathrm{cm}^{-3}$.
    pub fn profile(&self, r: f64) -> f64 {
        pressure_500(&self.cosmology, self.mass, self.z) * self.gnfw.evaluate(r / self.r500)
    }

    /// The tabulated profile.
    pub fn table(&self) -> &ProfileTable {
        &self.table
    }

    /// Line-of-sight projection at the angular positions `thetas`, given in units of the core
    /// radius $\theta_c = R_{500} / D_A$, normalized to the value at the first position.
    pub fn y2d_norm(&self, thetas: &[f64]) -> Result<Vec<f64>> {
        let rule = UniformRule::new(
            self.settings.los_step,
            self.settings.los_step,
            self.settings.los_samples,
        );

        let mut projected = thetas
            .iter()
            .map(|theta| {
                let b = theta * self.r500;
                integrate_checked(&|l: f64| 2.0 * self.table.at((l * l + b * b).sqrt()), &rule)
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = match projected.first() {
            Some(&first) if first > 0.0 && first.is_finite() => first,
            Some(&first) => {
                return Err(Error::numerical(format!(
                    "projected profile normalization is {}",
                    first
                )))
            }
            None => return Ok(projected),
        };

        projected.iter_mut().for_each(|y| *y /= norm);
        Ok(projected)
    }

    /// Hankel transform
    /// $\tilde y(\ell) = \int \mathrm{d}\theta\, \theta\, J_0(\ell\theta)\, y(\theta/\theta_c)$
    /// of the normalized projected profile.
    pub fn y2d_tilde_norm(
        &self,
        ells: &[f64],
        thtc: f64,
        filter: &FilterSettings,
    ) -> Result<Vec<f64>> {
        let rule =
            UniformRule::from_range(filter.hankel_step, filter.hankel_extent * thtc, filter.hankel_step);
        let thetas: Vec<f64> = rule.points().collect();
        let scaled: Vec<f64> = thetas.iter().map(|t| t / thtc).collect();
        let y2d = self.y2d_norm(&scaled)?;

        ells.iter()
            .map(|ell| {
                RiemannEstimators::from_values(
                    thetas
                        .iter()
                        .zip(y2d.iter())
                        .map(|(t, y)| t * bessel::j_n(0, ell * t) * y),
                    rule.step(),
                )
                .checked()
            })
            .collect()
    }

    /// Variance of the matched filter for a cluster at angular diameter distance `da` (in
    /// $h^{-1}\,\mathrm{Mpc}$) observed with the noise `noise`.
    pub fn filter_variance(
        &self,
        da: f64,
        noise: &NoiseSpectrum,
        filter: &FilterSettings,
    ) -> Result<f64> {
        if !(da > 0.0) {
            return Err(Error::numerical(format!(
                "filter variance needs a positive distance, got {}",
                da
            )));
        }

        let thtc = self.r500 / da;

        let ell_rule = UniformRule::from_range(filter.ell_min, filter.ell_max, filter.ell_step);
        let ells: Vec<f64> = ell_rule.points().collect();
        let freq_fac = f_nu(&self.cosmology.constants, filter.frequency_ghz).powi(2);
        let y2d_tilde = self.y2d_tilde_norm(&ells, thtc, filter)?;

        let var = RiemannEstimators::from_values(
            ells.iter()
                .zip(y2d_tilde.iter())
                .map(|(ell, yt)| ell * yt * yt / noise.at(*ell)),
            ell_rule.step(),
        )
        .checked()?
            * freq_fac;

        let real_rule =
            UniformRule::from_range(filter.real_step, filter.real_extent * thtc, filter.real_step);
        let thetas: Vec<f64> = real_rule.points().collect();
        let scaled: Vec<f64> = thetas.iter().map(|t| t / thtc).collect();
        let y2d = self.y2d_norm(&scaled)?;

        let prof_int = 2.0
            * PI
            * RiemannEstimators::from_values(
                y2d.iter().zip(thetas.iter()).map(|(y, t)| y * t),
                real_rule.step(),
            )
            .checked()?
            .powi(2);

        let variance = prof_int / var;
        if variance.is_finite() && variance > 0.0 {
            Ok(variance)
        } else {
            Err(Error::numerical(format!(
                "filter variance {} for M = {:e}, z = {}",
                variance, self.mass, self.z
            )))
        }
    }
}

/// The matched filter of a survey: cluster profile, sampling and the noise it is run against.
#[derive(Clone, Debug)]
pub struct MatchedFilter<'n> {
    /// Pressure profile of the filter template.
    pub gnfw: GnfwParameters,
    /// Sampling of the template.
    pub profile: ProfileSettings,
    /// Sampling of the filter integrals.
    pub filter: FilterSettings,
    /// CMB plus instrument noise.
    pub noise: &'n NoiseSpectrum,
}

impl MatchedFilter<'_> {
    /// Filter noise $\sigma_N$ of a cluster of mass `mass` at redshift `z` and angular diameter
    /// distance `da` ($h^{-1}\,\mathrm{Mpc}$).
    pub fn sigma_n(&self, cosmology: &CosmologyParameters, mass: f64, z: f64, da: f64) -> Result<f64> {
        let model = SzClusterModel::new(*cosmology, self.gnfw, mass, z, self.profile)?;
        Ok(model.filter_variance(da, self.noise, &self.filter)?.sqrt())
    }

    /// $\sigma_N$ at the centres of all mass and redshift bins.
    pub fn scatter_grid<O>(
        &self,
        cosmology: &CosmologyParameters,
        oracle: &O,
        mass_grid: &MassGrid,
        z_grid: &RedshiftGrid,
    ) -> Result<ScatterGrid>
    where
        O: PowerSpectrumOracle + ?Sized,
    {
        let mgrid = mass_grid.centers();
        let zgrid = z_grid.centers();
        let mut siggrid = Array2::zeros((mgrid.len(), zgrid.len()));

        for (j, &z) in zgrid.iter().enumerate() {
            let da = oracle.angular_diameter_distance(cosmology, z)? * cosmology.h();

            for (i, &m) in mgrid.iter().enumerate() {
                siggrid[[i, j]] = self.sigma_n(cosmology, m, z, da)?;
            }

            debug!("filter noise done for z = {:.3}", z);
        }

        Ok(ScatterGrid {
            mgrid,
            zgrid,
            siggrid,
        })
    }
}

/// Characteristic pressure $P_{500}$ of Arnaud et al. (2010) in $\mathrm{keV}\,\mathrm{cm}^{-3}$.
fn pressure_500(cosmology: &CosmologyParameters, mass: f64, z: f64) -> f64 {
    let m_fac = mass / 3e14 * (100.0 / 70.0);
    1.65e-3 * (100.0f64 / 70.0).powi(2) * m_fac.powf(2.0 / 3.0) * cosmology.e_z(z)
}

/// Names of the parameters of [`ScalingRelation`] that can be varied.
pub const SCALING_PARAMETER_NAMES: [&str; 5] = ["Y_star", "alpha_ym", "b_ym", "beta_ym", "Ysig"];

/// Log-normal $Y$–$M$ scaling relation with an error-function selection in $q = Y / \sigma_N$.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ScalingRelation {
    /// Normalization $Y_*$ in steradians.
    pub y_star: f64,
    /// Mass slope
    pub alpha_ym: f64,
    /// Hydrostatic mass bias
    pub b_ym: f64,
    /// Slope of the $E(z)$ evolution.
    pub beta_ym: f64,
    /// Log-normal scatter in $\ln Y$.
    pub sigma: f64,
    /// Detection threshold in units of $\sigma_N$.
    pub q: f64,
    /// Lower end of the $\ln Y$ grid.
    pub lny_min: f64,
    /// Step of the $\ln Y$ grid.
    pub dlny: f64,
    /// Number of $\ln Y$ samples.
    pub lny_samples: usize,
}

impl Default for ScalingRelation {
    fn default() -> Self {
        Self {
            y_star: 2.42e-10,
            alpha_ym: 1.79,
            b_ym: 0.8,
            beta_ym: 0.66,
            sigma: 0.127,
            q: 5.0,
            lny_min: 1e-13f64.ln(),
            dlny: 0.1,
            lny_samples: 100,
        }
    }
}

impl ScalingRelation {
    /// Value of the parameter `name`, one of [`SCALING_PARAMETER_NAMES`].
    pub fn value(&self, name: &str) -> Result<f64> {
        Ok(match name {
            "Y_star" => self.y_star,
            "alpha_ym" => self.alpha_ym,
            "b_ym" => self.b_ym,
            "beta_ym" => self.beta_ym,
            "Ysig" => self.sigma,
            _ => {
                return Err(Error::config(format!(
                    "unknown scaling-relation parameter '{}'",
                    name
                )))
            }
        })
    }

    /// A copy with `delta` added to the parameter `name`.
    pub fn with_offset(&self, name: &str, delta: f64) -> Result<Self> {
        let mut result = *self;
        let target = match name {
            "Y_star" => &mut result.y_star,
            "alpha_ym" => &mut result.alpha_ym,
            "b_ym" => &mut result.b_ym,
            "beta_ym" => &mut result.beta_ym,
            "Ysig" => &mut result.sigma,
            _ => {
                return Err(Error::config(format!(
                    "unknown scaling-relation parameter '{}'",
                    name
                )))
            }
        };
        *target += delta;

        Ok(result)
    }

    /// The $\ln Y$ grid the probabilities are summed over.
    pub fn lny_rule(&self) -> UniformRule<f64> {
        UniformRule::new(self.lny_min, self.dlny, self.lny_samples)
    }

    /// Mean integrated Compton $Y$ of a cluster of mass `mass` at redshift `z` and angular diameter
    /// distance `da` ($h^{-1}\,\mathrm{Mpc}$).
    pub fn y_m(&self, cosmology: &CosmologyParameters, mass: f64, z: f64, da: f64) -> f64 {
        self.y_star
            * (self.b_ym * mass / 1e14).powf(self.alpha_ym)
            * (da / 100.0).powi(-2)
            * cosmology.e_z(z).powf(self.beta_ym)
    }

    /// Probability that a cluster with signal `y` is found above `q` times the noise `sigma_n`.
    pub fn y_erf_at(&self, y: f64, sigma_n: f64, q: f64) -> f64 {
        0.5 * (1.0 + erf((y - q * sigma_n) / (SQRT_2 * sigma_n)))
    }

    /// Detection probability at the threshold of this relation.
    pub fn y_erf(&self, y: f64, sigma_n: f64) -> f64 {
        self.y_erf_at(y, sigma_n, self.q)
    }

    /// Log-normal density of $\ln Y$ around the mean `y_mean`.
    pub fn p_of_y(&self, lny: f64, y_mean: f64) -> f64 {
        let dev = lny - y_mean.ln();
        (-dev * dev / (2.0 * self.sigma * self.sigma)).exp() / (self.sigma * (2.0 * PI).sqrt())
    }

    /// Probability that a cluster with mean signal `y_mean` passes the threshold.
    pub fn p_of_q(&self, y_mean: f64, sigma_n: f64) -> Result<f64> {
        integrate_checked(
            &|lny: f64| self.p_of_y(lny, y_mean) * self.y_erf(lny.exp(), sigma_n),
            &self.lny_rule(),
        )
    }

    /// Probability that a cluster with mean signal `y_mean` is observed with a signal-to-noise in
    /// `[q_lo, q_hi)`.
    pub fn p_of_q_bin(&self, y_mean: f64, sigma_n: f64, q_lo: f64, q_hi: f64) -> Result<f64> {
        integrate_checked(
            &|lny: f64| {
                let y = lny.exp();
                self.p_of_y(lny, y_mean)
                    * (self.y_erf_at(y, sigma_n, q_lo) - self.y_erf_at(y, sigma_n, q_hi))
            },
            &self.lny_rule(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosmology::{Constants, CosmologyParameters};
    use crate::noise::{CmbSpectrum, NoiseModel};
    use assert_approx_eq::assert_approx_eq;

    fn coarse_profile() -> ProfileSettings {
        ProfileSettings {
            table_step: 1e-3,
            table_max: 100.0,
            los_step: 1e-3,
            los_samples: 10_000,
        }
    }

    #[test]
    fn arnaud_and_bbps_presets() {
        let arnaud = GnfwParameters::preset(ProfileModel::Arnaud);
        let bbps = GnfwParameters::preset(ProfileModel::Bbps);

        assert_eq!(arnaud.p0, 8.403);
        assert_eq!(bbps.beta, 4.19);
        // both profiles fall off monotonically outside the core
        assert!(arnaud.evaluate(0.5) > arnaud.evaluate(1.0));
        assert!(bbps.evaluate(1.0) > bbps.evaluate(2.0));
        assert_approx_eq!(bbps.evaluate(0.71), 7.49 / 2f64.powf(4.19), 1e-12);
    }

    #[test]
    fn spectral_function() {
        let constants = Constants::default();
        // the tSZ decrement turns into an increment at about 217 GHz
        assert!(f_nu(&constants, 150.0) < 0.0);
        assert!(f_nu(&constants, 280.0) > 0.0);
        assert_approx_eq!(f_nu(&constants, 1e-3), -2.0, 1e-3);
    }

    #[test]
    fn profile_table_interpolates_and_rejects_out_of_range_radii() {
        let table = ProfileTable::new(|r| 2.0 * r, 0.5, 3.0).unwrap();
        assert_eq!(table.len(), 5);
        assert_approx_eq!(table.at(0.75), 1.5, 1e-14);
        assert_approx_eq!(table.at(2.5), 5.0, 1e-14);
        assert!(table.at(0.25).is_nan());
        assert!(table.at(2.6).is_nan());

        assert!(ProfileTable::new(|r| r, 1.0, 1.5).is_err());
    }

    #[test]
    fn projected_profile_is_normalized_and_falling() {
        let cp = CosmologyParameters::default();
        let model =
            SzClusterModel::new(cp, GnfwParameters::default(), 3e14, 0.5, coarse_profile()).unwrap();

        let y = model.y2d_norm(&[0.1, 0.5, 1.0, 2.0]).unwrap();
        assert_approx_eq!(y[0], 1.0, 1e-14);
        assert!(y.windows(2).all(|w| w[1] < w[0]));
        assert_approx_eq!(model.table().at(0.5), model.profile(0.5), 1e-6 * model.profile(0.5));
    }

    #[test]
    fn projection_beyond_the_table_fails() {
        let cp = CosmologyParameters::default();
        let settings = ProfileSettings {
            table_max: 1.0,
            ..coarse_profile()
        };
        let model = SzClusterModel::new(cp, GnfwParameters::default(), 3e14, 0.5, settings).unwrap();

        assert!(matches!(
            model.y2d_norm(&[1.0]),
            Err(Error::NumericalInstability(_))
        ));
    }

    #[test]
    fn filter_variance_is_positive_and_drops_with_lower_noise() {
        let cp = CosmologyParameters::default();
        let model =
            SzClusterModel::new(cp, GnfwParameters::default(), 3e14, 0.5, coarse_profile()).unwrap();

        let ell: Vec<f64> = (2..3000).map(f64::from).collect();
        let dl = vec![1000.0; ell.len()];
        let cmb = CmbSpectrum::new(ell, dl).unwrap();

        let filter = FilterSettings {
            ell_step: 500.0,
            ell_max: 20_000.0,
            hankel_step: 5e-5,
            real_step: 2.5e-5,
            ..FilterSettings::default()
        };

        let noisy = NoiseModel::white(20.0, 1.5).tot_noise_spec(&cmb, &cp.constants);
        let quiet = NoiseModel::white(2.0, 1.5).tot_noise_spec(&cmb, &cp.constants);

        let da = 1200.0;
        let var_noisy = model.filter_variance(da, &noisy, &filter).unwrap();
        let var_quiet = model.filter_variance(da, &quiet, &filter).unwrap();

        assert!(var_quiet > 0.0);
        assert!(var_quiet < var_noisy);
    }

    #[test]
    fn log_normal_scatter_is_normalized() {
        let relation = ScalingRelation::default();
        let y_mean = 1e-11;

        let total = crate::integrators::riemann::integrate(
            &|lny: f64| relation.p_of_y(lny, y_mean),
            &relation.lny_rule(),
        )
        .integral();
        assert_approx_eq!(total, 1.0, 1e-6);

        // far above the threshold everything is detected, far below nothing
        assert_approx_eq!(relation.p_of_q(y_mean, 1e-14).unwrap(), 1.0, 1e-6);
        assert!(relation.p_of_q(y_mean, 1e-10).unwrap() < 1e-6);
    }

    #[test]
    fn q_bins_partition_the_detection_probability() {
        let relation = ScalingRelation::default();
        let (y_mean, sigma_n) = (1e-11, 1.5e-12);

        let edges = [5.0, 6.0, 8.0, 1e3];
        let binned: f64 = edges
            .windows(2)
            .map(|w| relation.p_of_q_bin(y_mean, sigma_n, w[0], w[1]).unwrap())
            .sum();

        assert_approx_eq!(binned, relation.p_of_q(y_mean, sigma_n).unwrap(), 1e-12);
    }

    #[test]
    fn y_m_scales_with_mass() {
        let relation = ScalingRelation::default();
        let cp = CosmologyParameters::default();

        let ratio = relation.y_m(&cp, 2e14, 0.3, 800.0) / relation.y_m(&cp, 1e14, 0.3, 800.0);
        assert_approx_eq!(ratio, 2f64.powf(1.79), 1e-12);

        let shifted = relation.with_offset("b_ym", 0.1).unwrap();
        assert_approx_eq!(shifted.b_ym, 0.9, 1e-15);
        assert!(relation.with_offset("w", 0.1).is_err());
    }
}
