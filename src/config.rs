//! The forecast configuration.
//!
//! A configuration is a JSON document that is deserialized once and then passed explicitly to
//! every stage. All sections are keyed by name, so that a forecast unit is selected by naming an
//! experiment, a grid, a calibration and a Fisher scenario:
//!
//! ```json
//! {
//!   "general": { "big_data_dir": "data/", "version": "1.0", "photoz_cutoff": 2.0 },
//!   "params": { "H0": { "value": 67.3, "step": 0.5 }, "s8": { "value": 0.82, "step": 0.01 } },
//!   "experiments": { "S4-1.5m": { "beams": [1.5], "noises": [1.0], "freqs": [150],
//!                                 "lmax": 3000, "fsky": 0.4 } },
//!   "grids": { "grid-default": { "mexprange": [14.0, 15.7, 0.1],
//!                                "zrange": [0.0, 3.0, 0.1], "qrange": [5.0, 100.0, 5.0] } },
//!   "calibrations": { "owl2": { "kind": "optical_weak_lensing" } },
//!   "fishers": { "mnu": { "param_list": ["H0", "s8", "tau", "b_wl"], "num_cosmo": 3 } }
//! }
//! ```
use crate::calibration::Calibration;
use crate::core::grids::{arange_edges, MassGrid, RedshiftGrid};
use crate::cosmology::{Constants, CosmologyParameters, COSMOLOGY_PARAMETER_NAMES};
use crate::error::{Error, Result};
use crate::sz::{FilterSettings, GnfwParameters, ProfileSettings, ScalingRelation, SCALING_PARAMETER_NAMES};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Settings shared by all forecast units.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GeneralConfig {
    /// Directory holding count grids, derivatives and saved Fisher matrices.
    pub big_data_dir: PathBuf,
    /// Version tag that becomes part of every file name.
    pub version: String,
    /// Redshift bins below this value are merged into one.
    pub photoz_cutoff: f64,
    /// Prefix of the CMB power spectra `{root}_fCls.csv` and `{root}_dCls_{param}.csv`.
    #[serde(default)]
    pub cmb_deriv_root: Option<PathBuf>,
    /// Lensed CMB temperature spectrum used as noise for the cluster filter.
    #[serde(default)]
    pub cltt_file: Option<PathBuf>,
}

/// Fiducial value of a parameter and the step of its finite difference.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ParamConfig {
    /// Fiducial value
    pub value: f64,
    /// Step of the central difference; parameters without a step are not differentiated.
    #[serde(default)]
    pub step: Option<f64>,
}

/// A CMB experiment with one or more frequency channels.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExperimentConfig {
    /// Beam FWHM per channel in arcmin.
    pub beams: Vec<f64>,
    /// White-noise level per channel in $\mu\mathrm{K}$-arcmin.
    pub noises: Vec<f64>,
    /// Channel frequencies in GHz.
    pub freqs: Vec<f64>,
    /// Smallest multipole of the CMB Fisher matrix.
    #[serde(default = "default_lmin")]
    pub lmin: f64,
    /// Largest multipole of the CMB Fisher matrix.
    pub lmax: f64,
    /// Knee multipole of the atmospheric noise, zero if absent.
    #[serde(default)]
    pub lknee: f64,
    /// Slope of the atmospheric noise.
    #[serde(default)]
    pub alpha: f64,
    /// Observed sky fraction.
    pub fsky: f64,
}

fn default_lmin() -> f64 {
    2.0
}

impl ExperimentConfig {
    /// Index of the channel at `freq` GHz.
    pub fn channel(&self, freq: f64) -> Result<usize> {
        // same tolerances as numpy's isclose
        self.freqs
            .iter()
            .position(|f| (f - freq).abs() <= 1e-8 + 1e-5 * freq.abs())
            .ok_or_else(|| {
                Error::config(format!(
                    "no channel at {} GHz among {:?}",
                    freq, self.freqs
                ))
            })
    }

    fn validate(&self, name: &str, errors: &mut Vec<String>) {
        let n = self.freqs.len();
        if n == 0 || self.beams.len() != n || self.noises.len() != n {
            errors.push(format!(
                "experiment `{}`: beams, noises and freqs need the same, non-zero length",
                name
            ));
        }

        if !(self.fsky > 0.0 && self.fsky <= 1.0) {
            errors.push(format!("experiment `{}`: fsky {} outside (0, 1]", name, self.fsky));
        }

        if !(self.lmax > self.lmin && self.lmin >= 2.0) {
            errors.push(format!(
                "experiment `{}`: invalid multipole range [{}, {}]",
                name, self.lmin, self.lmax
            ));
        }
    }
}

/// Binning of a forecast as `[start, stop, step]` triples, each including its stop value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GridConfig {
    /// Range of $\log_{10} M$.
    pub mexprange: [f64; 3],
    /// Range of redshifts.
    pub zrange: [f64; 3],
    /// Range of the signal-to-noise $q$.
    pub qrange: [f64; 3],
}

impl GridConfig {
    /// The mass grid
    pub fn mass_grid(&self) -> Result<MassGrid> {
        let [start, stop, step] = self.mexprange;
        MassGrid::new(arange_edges(start, stop, step)?)
    }

    /// The redshift grid
    pub fn z_grid(&self) -> Result<RedshiftGrid> {
        let [start, stop, step] = self.zrange;
        RedshiftGrid::new(arange_edges(start, stop, step)?)
    }

    /// Edges of the $q$ bins.
    pub fn q_edges(&self) -> Result<Vec<f64>> {
        let [start, stop, step] = self.qrange;
        arange_edges(start, stop, step)
    }
}

/// A Fisher scenario: parameters, priors and external information.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FisherConfig {
    /// Ordered parameter names; the first `num_cosmo` are shared with the external Fishers.
    pub param_list: Vec<String>,
    /// LaTeX labels for plotting, parallel to `param_list` when given.
    #[serde(default)]
    pub param_latex_list: Vec<String>,
    /// Parameters with a Gaussian prior.
    #[serde(default)]
    pub prior_names: Vec<String>,
    /// Widths of the priors, parallel to `prior_names`.
    #[serde(default)]
    pub prior_values: Vec<f64>,
    /// Number of cosmological parameters at the start of `param_list`.
    pub num_cosmo: usize,
    /// Add the primary CMB Fisher matrix.
    #[serde(default)]
    pub do_cmb_fisher: bool,
    /// Add CMB lensing to the CMB Fisher matrix; needs `do_cmb_fisher`.
    #[serde(default)]
    pub do_clkk_fisher: bool,
    /// Lensing section used when `do_clkk_fisher` is set.
    #[serde(default)]
    pub clkk_section: Option<String>,
    /// Suffix of the saved Fisher matrix.
    #[serde(default)]
    pub save_suffix: Option<String>,
    /// Planck Fisher matrix added to the leading block.
    #[serde(default)]
    pub planck_file: Option<PathBuf>,
    /// BAO Fisher matrix added to the leading block.
    #[serde(default)]
    pub bao_file: Option<PathBuf>,
    /// Any other Fisher matrix added to the leading block.
    #[serde(default)]
    pub other_file: Option<PathBuf>,
}

impl FisherConfig {
    fn validate(&self, name: &str, config: &ForecastConfig, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for param in &self.param_list {
            if !seen.insert(param) {
                errors.push(format!("fisher `{}`: duplicate parameter `{}`", name, param));
            }
        }

        if !self.param_latex_list.is_empty() && self.param_latex_list.len() != self.param_list.len() {
            errors.push(format!(
                "fisher `{}`: {} LaTeX labels for {} parameters",
                name,
                self.param_latex_list.len(),
                self.param_list.len()
            ));
        }

        if self.prior_names.len() != self.prior_values.len() {
            errors.push(format!(
                "fisher `{}`: {} prior names but {} prior values",
                name,
                self.prior_names.len(),
                self.prior_values.len()
            ));
        }

        if self.prior_values.iter().any(|s| !(*s > 0.0)) {
            errors.push(format!("fisher `{}`: prior widths must be positive", name));
        }

        if self.num_cosmo > self.param_list.len() {
            errors.push(format!(
                "fisher `{}`: num_cosmo {} exceeds the {} parameters",
                name,
                self.num_cosmo,
                self.param_list.len()
            ));
        }

        if self.do_cmb_fisher && config.general.cmb_deriv_root.is_none() {
            errors.push(format!(
                "fisher `{}`: the CMB Fisher matrix needs general.cmb_deriv_root",
                name
            ));
        }

        if self.do_clkk_fisher {
            if !self.do_cmb_fisher {
                errors.push(format!(
                    "fisher `{}`: the CMB lensing Fisher matrix requires do_cmb_fisher",
                    name
                ));
            }

            match &self.clkk_section {
                Some(section) if config.lensing.contains_key(section) => {}
                Some(section) => errors.push(format!(
                    "fisher `{}`: unknown lensing section `{}`",
                    name, section
                )),
                None => errors.push(format!(
                    "fisher `{}`: do_clkk_fisher needs clkk_section",
                    name
                )),
            }
        }
    }
}

/// Reconstruction noise of CMB lensing.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LensingConfig {
    /// Whitespace-separated columns $L$ and $N_L^{\kappa\kappa}$.
    pub noise_file: PathBuf,
}

/// Modelling choices for the SZ observable.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Pressure profile
    pub gnfw: GnfwParameters,
    /// Sampling of the profile and its projection.
    pub profile: ProfileSettings,
    /// Sampling of the matched filter.
    pub filter: FilterSettings,
    /// $Y$–$M$ relation and selection.
    pub relation: ScalingRelation,
}

/// The complete configuration of a forecast campaign.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ForecastConfig {
    /// Shared settings
    pub general: GeneralConfig,
    /// Physical constants
    #[serde(default)]
    pub constants: Constants,
    /// Fiducial values and steps of the forecast parameters.
    #[serde(default)]
    pub params: BTreeMap<String, ParamConfig>,
    /// SZ modelling
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Experiments by name
    pub experiments: BTreeMap<String, ExperimentConfig>,
    /// Grids by name
    pub grids: BTreeMap<String, GridConfig>,
    /// Calibrations by name
    pub calibrations: BTreeMap<String, Calibration>,
    /// Fisher scenarios by name
    pub fishers: BTreeMap<String, FisherConfig>,
    /// CMB lensing noise by name
    #[serde(default)]
    pub lensing: BTreeMap<String, LensingConfig>,
}

impl ForecastConfig {
    /// Read and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.validate()?;

        Ok(config)
    }

    /// Check every section and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !self.general.photoz_cutoff.is_finite() {
            errors.push("general: photoz_cutoff must be finite".to_string());
        }

        for (name, param) in &self.params {
            if !COSMOLOGY_PARAMETER_NAMES.contains(&name.as_str())
                && !SCALING_PARAMETER_NAMES.contains(&name.as_str())
                && param.step.is_some()
            {
                errors.push(format!(
                    "params: `{}` has a step but the count model does not depend on it",
                    name
                ));
            }

            if let Some(step) = param.step {
                if !(step > 0.0) {
                    errors.push(format!("params: step of `{}` must be positive", name));
                }
            }
        }

        for (name, experiment) in &self.experiments {
            experiment.validate(name, &mut errors);
        }

        for (name, grid) in &self.grids {
            for (what, result) in [
                ("mass", grid.mass_grid().map(|_| ())),
                ("redshift", grid.z_grid().map(|_| ())),
                ("q", grid.q_edges().map(|_| ())),
            ]
            .iter()
            {
                if let Err(err) = result {
                    errors.push(format!("grid `{}`: {} range: {}", name, what, err));
                }
            }
        }

        for (name, fisher) in &self.fishers {
            fisher.validate(name, self, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }

    /// The fiducial cosmology: the default parameters with the values of `params` applied.
    pub fn cosmology(&self) -> Result<CosmologyParameters> {
        let mut cosmology = CosmologyParameters {
            constants: self.constants,
            ..CosmologyParameters::default()
        };

        for (name, param) in &self.params {
            if COSMOLOGY_PARAMETER_NAMES.contains(&name.as_str()) {
                cosmology = cosmology.with_offset(name, param.value - cosmology.value(name)?)?;
            }
        }

        Ok(cosmology)
    }

    /// The fiducial scaling relation, with the values of `params` applied.
    pub fn relation(&self) -> Result<ScalingRelation> {
        let mut relation = self.cluster.relation;

        for (name, param) in &self.params {
            if SCALING_PARAMETER_NAMES.contains(&name.as_str()) {
                relation = relation.with_offset(name, param.value - relation.value(name)?)?;
            }
        }

        Ok(relation)
    }

    /// The experiment called `name`.
    pub fn experiment(&self, name: &str) -> Result<&ExperimentConfig> {
        lookup(&self.experiments, "experiment", name)
    }

    /// The grid called `name`.
    pub fn grid(&self, name: &str) -> Result<&GridConfig> {
        lookup(&self.grids, "grid", name)
    }

    /// The calibration called `name`.
    pub fn calibration(&self, name: &str) -> Result<&Calibration> {
        lookup(&self.calibrations, "calibration", name)
    }

    /// The Fisher scenario called `name`.
    pub fn fisher(&self, name: &str) -> Result<&FisherConfig> {
        lookup(&self.fishers, "fisher", name)
    }

    /// The lensing section called `name`.
    pub fn lensing(&self, name: &str) -> Result<&LensingConfig> {
        lookup(&self.lensing, "lensing", name)
    }
}

fn lookup<'a, T>(map: &'a BTreeMap<String, T>, what: &str, name: &str) -> Result<&'a T> {
    map.get(name)
        .ok_or_else(|| Error::config(format!("no {} section named `{}`", what, name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"{
        "general": { "big_data_dir": "/tmp/szar", "version": "0.6", "photoz_cutoff": 2.0 },
        "params": {
            "H0": { "value": 67.3, "step": 0.5 },
            "b_ym": { "value": 0.75, "step": 0.02 },
            "sigR": { "value": 0.75 }
        },
        "experiments": {
            "S4": { "beams": [1.5, 1.0], "noises": [1.0, 2.0], "freqs": [150, 220],
                    "lmax": 3000, "lknee": 3000, "alpha": -4, "fsky": 0.4 }
        },
        "grids": {
            "grid-default": { "mexprange": [14.0, 15.0, 0.5], "zrange": [0.0, 1.0, 0.5],
                              "qrange": [5.0, 10.0, 5.0] }
        },
        "calibrations": {
            "CMB_all": { "kind": "cmb_lensing", "freq": 150 },
            "owl2": { "kind": "optical_weak_lensing" }
        },
        "fishers": {
            "mnu": { "param_list": ["H0", "tau", "b_ym"], "num_cosmo": 2,
                     "prior_names": ["tau"], "prior_values": [0.01] }
        }
    }"#;

    #[test]
    fn parse_and_validate() {
        let config: ForecastConfig = serde_json::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.experiment("S4").unwrap().channel(220.0).unwrap(), 1);
        assert!(config.experiment("SO").is_err());
        assert_eq!(config.grid("grid-default").unwrap().q_edges().unwrap(), vec![5.0, 10.0]);
        assert_eq!(config.fisher("mnu").unwrap().num_cosmo, 2);
        assert_eq!(
            config.calibration("owl2").unwrap(),
            &Calibration::OpticalWeakLensing
        );
    }

    #[test]
    fn fiducial_values_are_applied() {
        let config: ForecastConfig = serde_json::from_str(CONFIG).unwrap();

        let cosmology = config.cosmology().unwrap();
        assert_approx_eq!(cosmology.h0, 67.3, 1e-12);
        assert_eq!(cosmology.s8, CosmologyParameters::default().s8);

        assert_approx_eq!(config.relation().unwrap().b_ym, 0.75, 1e-15);
    }

    #[test]
    fn all_problems_are_reported() {
        let mut config: ForecastConfig = serde_json::from_str(CONFIG).unwrap();
        let fisher = config.fishers.get_mut("mnu").unwrap();
        fisher.prior_values.push(0.1);
        fisher.do_clkk_fisher = true;
        config.experiments.get_mut("S4").unwrap().fsky = 0.0;

        let message = match config.validate() {
            Err(Error::Configuration(message)) => message,
            other => panic!("unexpected {:?}", other),
        };

        assert!(message.contains("prior values"));
        assert!(message.contains("requires do_cmb_fisher"));
        assert!(message.contains("fsky"));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = ForecastConfig::load(file.path()).unwrap();
        assert_eq!(config.general.version, "0.6");
        assert!(matches!(
            ForecastConfig::load("/nonexistent/szar.json"),
            Err(Error::MissingArtifact { .. })
        ));
    }
}
