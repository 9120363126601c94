//! Mass calibration of the cluster sample and the nuisance parameters it brings along.
use crate::config::ExperimentConfig;
use crate::error::{Error, Result};

use log::info;
use serde::{Deserialize, Serialize};

/// Name of the beam nuisance parameter of CMB-lensing calibration.
pub const SIGMA_R: &str = "sigR";

/// Name of the weak-lensing mass bias of optical calibration.
pub const B_WL: &str = "b_wl";

/// Default Gaussian prior on the weak-lensing mass bias.
const B_WL_PRIOR: f64 = 0.01;

/// How cluster masses are calibrated.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calibration {
    /// Lensing of the CMB behind the clusters, measured in the channel at `freq` GHz.
    CmbLensing {
        /// Frequency of the channel in GHz.
        freq: f64,
    },
    /// Optical weak lensing of background galaxies.
    OpticalWeakLensing,
    /// No calibration.
    None,
}

/// A nuisance parameter with a Gaussian prior of width `sigma`.
#[derive(Clone, Debug, PartialEq)]
pub struct Nuisance {
    /// Parameter name
    pub name: &'static str,
    /// Width of the prior.
    pub sigma: f64,
}

impl Calibration {
    /// The nuisance parameter this calibration adds to `params`, if any.
    ///
    /// CMB lensing always adds [`SIGMA_R`] with a prior of half the beam of the calibration
    /// channel, and fails if `params` already has it. Optical weak lensing adds [`B_WL`] with a
    /// 1% prior unless it is already part of `params`.
    pub fn nuisance(
        &self,
        experiment: &ExperimentConfig,
        params: &[String],
    ) -> Result<Option<Nuisance>> {
        match self {
            Self::CmbLensing { freq } => {
                if params.iter().any(|p| p == SIGMA_R) {
                    return Err(Error::config(format!(
                        "`{}` is added by CMB-lensing calibration and must not be listed",
                        SIGMA_R
                    )));
                }

                let index = experiment.channel(*freq)?;
                let sigma = experiment
                    .beams
                    .get(index)
                    .ok_or_else(|| {
                        Error::config(format!("no beam for the channel at {} GHz", freq))
                    })?
                    / 2.0;
                info!("added {} prior {}", SIGMA_R, sigma);

                Ok(Some(Nuisance {
                    name: SIGMA_R,
                    sigma,
                }))
            }
            Self::OpticalWeakLensing => {
                if params.iter().any(|p| p == B_WL) {
                    Ok(None)
                } else {
                    info!("{} not in the parameter list, adding it with a 1% prior", B_WL);
                    Ok(Some(Nuisance {
                        name: B_WL,
                        sigma: B_WL_PRIOR,
                    }))
                }
            }
            Self::None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            beams: vec![7.0, 1.5, 1.0],
            noises: vec![20.0, 5.0, 10.0],
            freqs: vec![90.0, 150.0, 220.0],
            lmin: 2.0,
            lmax: 3000.0,
            lknee: 0.0,
            alpha: 0.0,
            fsky: 0.4,
        }
    }

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cmb_lensing_adds_half_the_beam() {
        let cal = Calibration::CmbLensing { freq: 150.0 };
        let nuisance = cal
            .nuisance(&experiment(), &params(&["H0", "om"]))
            .unwrap()
            .unwrap();

        assert_eq!(nuisance.name, "sigR");
        assert_eq!(nuisance.sigma, 0.75);
    }

    #[test]
    fn cmb_lensing_rejects_a_listed_sig_r() {
        let cal = Calibration::CmbLensing { freq: 150.0 };
        assert!(matches!(
            cal.nuisance(&experiment(), &params(&["H0", "sigR"])),
            Err(Error::Configuration(_))
        ));

        let unknown_channel = Calibration::CmbLensing { freq: 40.0 };
        assert!(unknown_channel.nuisance(&experiment(), &params(&["H0"])).is_err());
    }

    #[test]
    fn cmb_lensing_needs_a_beam_for_the_channel() {
        let mut experiment = experiment();
        experiment.beams.truncate(1);

        let cal = Calibration::CmbLensing { freq: 150.0 };
        assert!(matches!(
            cal.nuisance(&experiment, &params(&["H0"])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn optical_lensing_adds_b_wl_once() {
        let cal = Calibration::OpticalWeakLensing;
        let added = cal.nuisance(&experiment(), &params(&["H0"])).unwrap();
        assert_eq!(
            added,
            Some(Nuisance {
                name: "b_wl",
                sigma: 0.01
            })
        );

        assert_eq!(cal.nuisance(&experiment(), &params(&["H0", "b_wl"])).unwrap(), None);
        assert_eq!(Calibration::None.nuisance(&experiment(), &[]).unwrap(), None);
    }

    #[test]
    fn calibrations_are_tagged_in_json() {
        let cal: Calibration = serde_json::from_str(r#"{"kind": "cmb_lensing", "freq": 150}"#).unwrap();
        assert_eq!(cal, Calibration::CmbLensing { freq: 150.0 });

        let cal: Calibration = serde_json::from_str(r#"{"kind": "optical_weak_lensing"}"#).unwrap();
        assert_eq!(cal, Calibration::OpticalWeakLensing);
    }
}
