//! Instrument noise and the primary CMB as noise for the cluster matched filter.
use crate::config::ExperimentConfig;
use crate::cosmology::Constants;
use crate::error::{Error, Result};
use crate::integrators::interp;

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

/// Number of zero-power multipoles appended to a CMB spectrum.
const EXTRA_MULTIPOLES: usize = 60_000;

/// Converts an angle from arcminutes into radians.
pub fn arcmin_to_rad(arcmin: f64) -> f64 {
    (arcmin / 60.0).to_radians()
}

/// Beam-smoothed white noise of one frequency channel, optionally with an atmospheric $1/f$
/// component $N_\ell \to N_\ell\,[1 + (\ell / \ell_\mathrm{knee})^\alpha]$.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct NoiseModel {
    /// White-noise level in $\mu\mathrm{K}$-arcmin.
    pub rms_noise: f64,
    /// Beam full width at half maximum in arcmin.
    pub fwhm: f64,
    /// Knee multipole of the $1/f$ noise; zero disables it.
    #[serde(default)]
    pub lknee: f64,
    /// Slope of the $1/f$ noise.
    #[serde(default)]
    pub alpha: f64,
}

impl NoiseModel {
    /// White noise without a knee.
    pub fn white(rms_noise: f64, fwhm: f64) -> Self {
        Self {
            rms_noise,
            fwhm,
            lknee: 0.0,
            alpha: 0.0,
        }
    }

    /// The channel of `experiment` whose frequency is closest to, and within 1e-5 relative of,
    /// `freq` GHz.
    pub fn from_experiment(experiment: &ExperimentConfig, freq: f64) -> Result<Self> {
        let index = experiment.channel(freq)?;

        Ok(Self {
            rms_noise: experiment.noises[index],
            fwhm: experiment.beams[index],
            lknee: experiment.lknee,
            alpha: experiment.alpha,
        })
    }

    /// Beam-deconvolved noise power $N_\ell$ in $\mu\mathrm{K}^2\,\mathrm{sr}$.
    pub fn noise_func(&self, ell: f64) -> f64 {
        let rms = arcmin_to_rad(self.rms_noise);
        let tht_fwhm = arcmin_to_rad(self.fwhm);

        let white = rms * rms * (tht_fwhm * tht_fwhm * ell * ell / (8.0 * 2f64.ln())).exp();

        if self.lknee > 0.0 && ell > 0.0 {
            white * (1.0 + (ell / self.lknee).powf(self.alpha))
        } else {
            white
        }
    }

    /// Total noise seen by the cluster filter: CMB plus instrument noise, in units of
    /// $T_\mathrm{CMB}^2$.
    pub fn tot_noise_spec(&self, cmb: &CmbSpectrum, constants: &Constants) -> NoiseSpectrum {
        let last = cmb.ell.last().copied().unwrap_or(1.0);
        let tcmb2 = constants.tcmb_muk().powi(2);

        let mut ell = cmb.ell.clone();
        let mut cl: Vec<f64> = cmb
            .ell
            .iter()
            .zip(cmb.dl.iter())
            .map(|(l, d)| d * 2.0 * PI / (l * (l + 1.0)))
            .collect();

        ell.extend((0..EXTRA_MULTIPOLES).map(|i| last + 1.0 + i as f64));
        cl.resize(ell.len(), 0.0);

        let cltot = ell
            .iter()
            .zip(cl.iter())
            .map(|(l, c)| (c + self.noise_func(*l)) / tcmb2)
            .collect();

        NoiseSpectrum { ell, cltot, cl }
    }
}

/// Lensed CMB temperature power spectrum $D_\ell = \ell(\ell+1) C_\ell / 2\pi$ in
/// $\mu\mathrm{K}^2$.
#[derive(Clone, Debug, PartialEq)]
pub struct CmbSpectrum {
    /// Multipoles, increasing.
    pub ell: Vec<f64>,
    /// $D_\ell$ at `ell`.
    pub dl: Vec<f64>,
}

impl CmbSpectrum {
    /// Read the first two space-separated columns ($\ell$, $D_\ell^{TT}$) of a CAMB
    /// `scalCls`-style file. Lines starting with `#` are skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let (ell, dl) = read_two_columns(path)?;
        Self::new(ell, dl)
    }

    /// Constructor; multipoles must be positive and increasing.
    pub fn new(ell: Vec<f64>, dl: Vec<f64>) -> Result<Self> {
        if ell.is_empty() || ell.len() != dl.len() {
            return Err(Error::config("CMB spectrum needs matching, non-empty columns"));
        }

        if ell[0] <= 0.0 || ell.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::config(
                "CMB spectrum multipoles must be positive and increasing",
            ));
        }

        Ok(Self { ell, dl })
    }
}

/// The first two columns of a space-separated table; further columns are ignored and lines
/// starting with `#` are skipped.
pub(crate) fn read_two_columns(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .delimiter(b' ')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut first = Vec::new();
    let mut second = Vec::new();

    for (number, record) in reader.records().enumerate() {
        let record = record?;
        let mut values = record
            .iter()
            .filter(|field| !field.is_empty())
            .take(2)
            .map(str::parse::<f64>);

        match (values.next(), values.next()) {
            (Some(Ok(a)), Some(Ok(b))) => {
                first.push(a);
                second.push(b);
            }
            (None, _) => {}
            _ => {
                return Err(Error::config(format!(
                    "{}:{}: expected two numeric columns",
                    path.display(),
                    number + 1
                )))
            }
        }
    }

    Ok((first, second))
}

/// Noise power spectrum of the matched filter.
#[derive(Clone, Debug)]
pub struct NoiseSpectrum {
    /// Multipoles
    pub ell: Vec<f64>,
    /// CMB plus noise in units of $T_\mathrm{CMB}^2$.
    pub cltot: Vec<f64>,
    /// CMB alone, in $\mu\mathrm{K}^2$.
    pub cl: Vec<f64>,
}

impl NoiseSpectrum {
    /// Total noise interpolated at `ell`.
    pub fn at(&self, ell: f64) -> f64 {
        interp(ell, &self.ell, &self.cltot)
    }
}
