//! Assembly of complete forecasts: cluster counts, calibration priors, CMB and other external
//! Fisher matrices, persistence and parallel sweeps over many forecast units.
use crate::callbacks::Callback;
use crate::cmb::{self, LensingNoise};
use crate::config::ForecastConfig;
use crate::core::compute_units_for_core;
use crate::core::grids::ScatterGrid;
use crate::core::PowerSpectrumOracle;
use crate::counts::{CountFiles, CountModel};
use crate::error::{Error, Result};
use crate::fisher::{get_fisher, load_fisher, FisherMatrix, PriorSet};
use crate::halo::HaloMassFunction;
use crate::noise::{CmbSpectrum, NoiseModel};
use crate::sz::MatchedFilter;

use crossbeam as cb;
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

/// Identifier of the count files of an experiment, grid and calibration.
pub fn save_id(experiment: &str, grid: &str, calibration: &str, version: &str) -> String {
    format!("{}_{}_{}_v{}", experiment, grid, calibration, version)
}

/// One forecast: an experiment observing a grid, calibrated in one way, analysed in one Fisher
/// scenario. All names refer to sections of a [`ForecastConfig`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForecastUnit {
    /// Experiment section
    pub experiment: String,
    /// Grid section
    pub grid: String,
    /// Calibration section
    pub calibration: String,
    /// Fisher section
    pub fisher: String,
}

impl ForecastUnit {
    /// Constructor.
    pub fn new(experiment: &str, grid: &str, calibration: &str, fisher: &str) -> Self {
        Self {
            experiment: experiment.to_string(),
            grid: grid.to_string(),
            calibration: calibration.to_string(),
            fisher: fisher.to_string(),
        }
    }

    /// Identifier of the count files of this unit.
    pub fn save_id(&self, version: &str) -> String {
        save_id(&self.experiment, &self.grid, &self.calibration, version)
    }
}

impl fmt::Display for ForecastUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.experiment, self.grid, self.calibration, self.fisher
        )
    }
}

/// Fisher matrices that replace the files named in the Fisher section. A zero matrix switches
/// the corresponding contribution off.
#[derive(Clone, Debug, Default)]
pub struct ExternalFishers {
    /// Replaces `planck_file`.
    pub planck: Option<FisherMatrix>,
    /// Replaces `bao_file`.
    pub bao: Option<FisherMatrix>,
    /// Replaces `other_file`.
    pub other: Option<FisherMatrix>,
}

/// Path of the saved Fisher matrix of `unit`.
pub fn fisher_path(config: &ForecastConfig, unit: &ForecastUnit) -> Result<PathBuf> {
    let suffix = config
        .fisher(&unit.fisher)?
        .save_suffix
        .clone()
        .unwrap_or_else(|| unit.fisher.clone());

    Ok(config.general.big_data_dir.join(format!(
        "savedFisher_{}_{}.json",
        unit.save_id(&config.general.version),
        suffix
    )))
}

/// The parameter list of `unit` extended by the nuisance parameter of its calibration, and the
/// priors including the one on that nuisance parameter. A configured prior on the nuisance
/// parameter takes precedence over the one of the calibration.
pub fn priors_from_config(
    config: &ForecastConfig,
    unit: &ForecastUnit,
) -> Result<(Vec<String>, PriorSet)> {
    let fisher = config.fisher(&unit.fisher)?;
    let experiment = config.experiment(&unit.experiment)?;
    let calibration = config.calibration(&unit.calibration)?;

    let mut params = fisher.param_list.clone();
    let mut priors = PriorSet::from_lists(&fisher.prior_names, &fisher.prior_values)?;

    if let Some(nuisance) = calibration.nuisance(experiment, &params)? {
        params.push(nuisance.name.to_string());

        if priors.contains(nuisance.name) {
            info!("keeping the configured prior on {}", nuisance.name);
        } else {
            priors.push(nuisance.name, nuisance.sigma)?;
        }
    }

    Ok((params, priors))
}

/// The Fisher matrix of `unit`: cluster counts with priors, plus the CMB and external Fisher
/// matrices on the leading cosmological parameters.
pub fn assemble_fisher(
    config: &ForecastConfig,
    unit: &ForecastUnit,
    overrides: &ExternalFishers,
) -> Result<FisherMatrix> {
    config.validate()?;

    let experiment = config.experiment(&unit.experiment)?;
    let grid = config.grid(&unit.grid)?;
    let fisher_config = config.fisher(&unit.fisher)?;
    let (params, priors) = priors_from_config(config, unit)?;

    let lensing = if fisher_config.do_clkk_fisher {
        let section = fisher_config.clkk_section.as_deref().unwrap_or_default();
        Some(LensingNoise::load(&config.lensing(section)?.noise_file)?)
    } else {
        None
    };

    let files = CountFiles::new(
        &config.general.big_data_dir,
        &unit.save_id(&config.general.version),
        grid.z_grid()?.edges().to_vec(),
        config.general.photoz_cutoff,
        experiment.fsky,
    );

    let fiducial = files.fiducial()?;
    info!("effective number of clusters: {:.2}", fiducial.total());

    let mut fisher = get_fisher(&fiducial, &params, &priors, &files)?;
    let cosmo_params = &params[..fisher_config.num_cosmo];

    if fisher_config.do_cmb_fisher {
        let root = config
            .general
            .cmb_deriv_root
            .as_ref()
            .ok_or_else(|| Error::config("the CMB Fisher matrix needs general.cmb_deriv_root"))?;
        let cmb = cmb::fisher_from_files(root, cosmo_params, experiment, lensing.as_ref())?;
        fisher.add_leading_fisher(&cmb)?;
    }

    let externals = [
        ("Planck", &overrides.planck, &fisher_config.planck_file),
        ("BAO", &overrides.bao, &fisher_config.bao_file),
        ("other", &overrides.other, &fisher_config.other_file),
    ];

    for (name, replacement, file) in externals.iter() {
        let external = match (replacement.as_ref(), file.as_ref()) {
            (Some(matrix), _) => matrix.clone(),
            (None, Some(path)) => load_fisher(path)?,
            (None, None) => continue,
        };

        debug!("adding {} Fisher matrix for {:?}", name, external.params());
        fisher.add_leading_fisher(&external)?;
    }

    Ok(fisher)
}

/// Assemble the Fisher matrix of `unit`, save it and log the marginalized errors.
pub fn run_unit(
    config: &ForecastConfig,
    unit: &ForecastUnit,
    overrides: &ExternalFishers,
) -> Result<FisherMatrix> {
    let fisher = assemble_fisher(config, unit, overrides)?;
    let path = fisher_path(config, unit)?;
    fisher.save(&path)?;
    debug!("saved Fisher matrix of {} to {}", unit, path.display());

    match fisher.marginalized_errors() {
        Ok(errors) => {
            for (param, sigma) in errors {
                info!("{}: sigma({}) = {:e}", unit, param, sigma);
            }
        }
        Err(err) => warn!("{}: no marginalized errors, {}", unit, err),
    }

    Ok(fisher)
}

/// The result of one unit of a sweep.
#[derive(Debug)]
pub struct UnitOutcome {
    /// The unit
    pub unit: ForecastUnit,
    /// Its Fisher matrix, or why there is none.
    pub result: Result<FisherMatrix>,
}

/// Run all `units` on `n_cores` threads and return their outcomes in the order of `units`.
///
/// Units are independent: a failing unit is reported through `callback` and in the outcomes but
/// does not stop the others.
pub fn run_sweep(
    config: &ForecastConfig,
    units: &[ForecastUnit],
    overrides: &ExternalFishers,
    n_cores: usize,
    callback: &dyn Callback,
) -> Vec<UnitOutcome> {
    let n_cores = n_cores.max(1);
    // finished units in the order they finished, and their positions in `units`
    let finished = Mutex::new((Vec::new(), Vec::with_capacity(units.len())));

    let mut start = 0;
    let ranges: Vec<_> = (0..n_cores)
        .map(|core| {
            let count = compute_units_for_core(core, n_cores, units.len());
            start += count;
            (start - count)..start
        })
        .collect();

    let sweep = cb::thread::scope(|s| {
        let mut handles = Vec::with_capacity(n_cores);

        for range in ranges.iter().cloned() {
            let finished = &finished;

            handles.push(s.spawn(move |_| {
                for index in range {
                    let unit = &units[index];
                    let outcome = UnitOutcome {
                        unit: unit.clone(),
                        result: run_unit(config, unit, overrides),
                    };

                    match finished.lock() {
                        Ok(mut guard) => {
                            let (indices, outcomes) = &mut *guard;
                            indices.push(index);
                            outcomes.push(outcome);
                            callback.print(outcomes);
                        }
                        Err(_) => error!("outcome of {} lost, another worker panicked", unit),
                    }
                }
            }));
        }

        // wait for the threads to finish
        for (handle, range) in handles.into_iter().zip(ranges.iter()) {
            if handle.join().is_err() {
                error!("worker for units {:?} panicked", range);
            }
        }
    });

    if sweep.is_err() {
        error!("forecast sweep aborted");
    }

    let (indices, outcomes) = finished
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut results: Vec<Option<Result<FisherMatrix>>> = (0..units.len()).map(|_| None).collect();
    for (index, outcome) in indices.into_iter().zip(outcomes) {
        results[index] = Some(outcome.result);
    }

    units
        .iter()
        .zip(results)
        .map(|(unit, result)| UnitOutcome {
            unit: unit.clone(),
            result: result.unwrap_or_else(|| Err(Error::numerical("unit did not finish"))),
        })
        .collect()
}

/// Matched-filter noise $\sigma_N$ of the bins of a grid, as observed by an experiment in the
/// channel of the filter frequency.
pub fn make_scatter_grid<O>(
    config: &ForecastConfig,
    oracle: &O,
    experiment: &str,
    grid: &str,
) -> Result<ScatterGrid>
where
    O: PowerSpectrumOracle + ?Sized,
{
    let experiment = config.experiment(experiment)?;
    let grid = config.grid(grid)?;
    let cltt_file = config
        .general
        .cltt_file
        .as_ref()
        .ok_or_else(|| Error::config("the matched filter needs general.cltt_file"))?;

    let cosmology = config.cosmology()?;
    let filter = config.cluster.filter;
    let noise = NoiseModel::from_experiment(experiment, filter.frequency_ghz)?
        .tot_noise_spec(&CmbSpectrum::load(cltt_file)?, &cosmology.constants);

    let matched = MatchedFilter {
        gnfw: config.cluster.gnfw,
        profile: config.cluster.profile,
        filter,
        noise: &noise,
    };

    matched.scatter_grid(&cosmology, oracle, &grid.mass_grid()?, &grid.z_grid()?)
}

/// Path of the scatter grid of an experiment and grid.
pub fn scatter_grid_path(config: &ForecastConfig, experiment: &str, grid: &str) -> PathBuf {
    config.general.big_data_dir.join(format!(
        "szgrid_{}_{}_v{}.json",
        experiment, grid, config.general.version
    ))
}

/// Compute and write the fiducial counts and their derivatives for `unit` with respect to every
/// parameter of `params` that has a step.
pub fn make_derivatives<O>(config: &ForecastConfig, oracle: &O, unit: &ForecastUnit) -> Result<()>
where
    O: PowerSpectrumOracle + ?Sized,
{
    let grid = config.grid(&unit.grid)?;
    let scatter = ScatterGrid::load(scatter_grid_path(config, &unit.experiment, &unit.grid))?;
    let mass_grid = grid.mass_grid()?;
    let z_grid = grid.z_grid()?;
    let q_edges = grid.q_edges()?;

    let model = CountModel::new(
        oracle,
        config.cosmology()?,
        config.relation()?,
        &mass_grid,
        &z_grid,
        &q_edges,
        &scatter,
    );

    let steps: Vec<(String, f64)> = config
        .params
        .iter()
        .filter_map(|(name, param)| param.step.map(|step| (name.clone(), step)))
        .collect();

    model.write_derivatives(
        &config.general.big_data_dir,
        &unit.save_id(&config.general.version),
        &steps,
    )
}

/// Expected number of clusters an experiment detects on a grid, on its observed sky.
pub fn counts_from_config<O>(
    config: &ForecastConfig,
    oracle: &O,
    experiment: &str,
    grid: &str,
) -> Result<f64>
where
    O: PowerSpectrumOracle + ?Sized,
{
    let fsky = config.experiment(experiment)?.fsky;
    let scatter = ScatterGrid::load(scatter_grid_path(config, experiment, grid))?;
    let grid = config.grid(grid)?;

    let hmf = HaloMassFunction::new(config.cosmology()?, oracle);
    let n_z = hmf.n_of_z_sz(
        &grid.mass_grid()?,
        &grid.z_grid()?,
        &config.relation()?,
        &scatter,
    )?;

    Ok(n_z.sum() * fsky)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_ids() {
        assert_eq!(save_id("S4-1.5m", "grid-owl2", "owl2", "0.6"), "S4-1.5m_grid-owl2_owl2_v0.6");

        let unit = ForecastUnit::new("SO", "grid-default", "CMB_all", "mnu");
        assert_eq!(unit.save_id("1.0"), "SO_grid-default_CMB_all_v1.0");
        assert_eq!(unit.to_string(), "SO grid-default CMB_all mnu");
    }
}
