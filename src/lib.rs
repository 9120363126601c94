#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! The crate `szar` forecasts how well a survey of galaxy clusters, selected through their
//! [Sunyaev-Zel'dovich] (SZ) signal, constrains cosmological parameters. The forecast is a
//! [Fisher matrix] built from the expected cluster counts binned in mass, redshift and
//! signal-to-noise, optionally combined with primary CMB, CMB lensing, BAO and any other external
//! Fisher matrices.
//!
//! # Features
//!
//! - **Binned cluster counts**. Counts follow from the Tinker mass function, a GNFW pressure
//! profile and a log-normal $Y$–$M$ relation, selected with the noise of a matched filter.
//! - **Finite-difference derivatives**. Fiducial counts and their derivatives with respect to every
//! parameter are written as `.npy` arrays and read back when the Fisher matrix is assembled, so
//! that the expensive part runs once per experiment and grid.
//! - **Mass calibration**. CMB-lensing and optical weak-lensing calibration add their nuisance
//! parameters together with the corresponding priors.
//! - **Pluggable power spectra**. Everything cosmological comes from a
//! [`PowerSpectrumOracle`]; [`oracle::FlatLcdmOracle`] is a fast analytic implementation.
//! - **Parallel sweeps**. [`forecast::run_sweep`] distributes independent forecast units across
//! threads; a failing unit never stops the others.
//!
//! # What is ...?
//!
//! Given the fiducial counts $N_b$ in bin $b$ and their derivatives with respect to the parameters
//! $p_i$, the Fisher matrix is
//!
//! $$ F_{ij} = \sum_b \frac{1}{N_b} \frac{\partial N_b}{\partial p_i} \frac{\partial N_b}{\partial
//! p_j} $$
//!
//! where bins with $N_b = 0$ do not contribute. A Gaussian prior of width $\sigma_i$ adds
//! $1/\sigma_i^2$ to $F_{ii}$, and the marginalized error of $p_i$ is $\sqrt{(F^{-1})_{ii}}$. We
//! use the following terms:
//!
//! - a *unit* is one forecast: an experiment observing a grid, with one calibration, analysed in
//! one Fisher scenario,
//! - the *leading block* of a Fisher matrix is the block of the first `num_cosmo` parameters,
//! which external Fisher matrices are added to,
//! - the *photo-z cutoff* is the redshift below which all bins are merged into one.
//!
//! [Sunyaev-Zel'dovich]: https://en.wikipedia.org/wiki/Sunyaev%E2%80%93Zeldovich_effect
//! [Fisher matrix]: https://en.wikipedia.org/wiki/Fisher_information

pub mod calibration;
pub mod callbacks;
pub mod cmb;
pub mod config;
pub mod core;
pub mod cosmology;
pub mod counts;
pub mod error;
pub mod fisher;
pub mod forecast;
pub mod halo;
pub mod integrators;
pub mod noise;
pub mod oracle;
pub mod sz;

pub use crate::core::*;
pub use error::{Error, Result};
