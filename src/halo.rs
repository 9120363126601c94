//! Halo abundance: the Tinker mass function, the cosmological volume element and the NFW halo
//! tools needed to convert between mass definitions.
//!
//! Masses are in $h^{-1} M_\odot$, radii in $h^{-1}\,\mathrm{Mpc}$ and densities in
//! $h^2 M_\odot / \mathrm{Mpc}^3$ throughout.
use crate::core::grids::{MassGrid, RedshiftGrid, ScatterGrid};
use crate::core::{MatterPower, PowerSpectrumOracle};
use crate::cosmology::CosmologyParameters;
use crate::error::{Error, Result};
use crate::integrators::{interp, trapezoid};
use crate::sz::ScalingRelation;

use log::debug;
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use std::f64::consts::PI;

/// Overdensities, relative to the mean matter density, at which the Tinker et al. (2008) fit is
/// tabulated.
const TINKER_DELTAS: [f64; 9] = [200.0, 300.0, 400.0, 600.0, 800.0, 1200.0, 1600.0, 2400.0, 3200.0];
const TINKER_A: [f64; 9] = [0.186, 0.200, 0.212, 0.218, 0.248, 0.255, 0.260, 0.260, 0.260];
const TINKER_SMALL_A: [f64; 9] = [1.47, 1.52, 1.56, 1.61, 1.87, 2.13, 2.30, 2.53, 2.66];
const TINKER_B: [f64; 9] = [2.57, 2.25, 2.05, 1.87, 1.59, 1.51, 1.46, 1.44, 1.41];
const TINKER_C: [f64; 9] = [1.19, 1.27, 1.34, 1.45, 1.58, 1.80, 1.97, 2.24, 2.44];

/// Step in $\ln M$ of the central difference for $\mathrm{d}\ln\sigma / \mathrm{d}\ln M$.
const DLNM: f64 = 1e-2;

/// Parameters of the Tinker multiplicity function
/// $f(\sigma) = A \left[ (\sigma/b)^{-a} + 1 \right] e^{-c/\sigma^2}$ at a given overdensity
/// and redshift.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TinkerParameters {
    /// Amplitude $A$.
    pub big_a: f64,
    /// Slope $a$.
    pub a: f64,
    /// Scale $b$.
    pub b: f64,
    /// Cut-off $c$.
    pub c: f64,
}

impl TinkerParameters {
    /// Interpolate the tabulated fit in $\log_{10}\Delta$ and evolve it to redshift `z`.
    pub fn new(delta: f64, z: f64) -> Result<Self> {
        if !(TINKER_DELTAS[0]..=TINKER_DELTAS[8]).contains(&delta) {
            return Err(Error::config(format!(
                "overdensity {} outside of the Tinker fit range [200, 3200]",
                delta
            )));
        }

        let log_deltas: Vec<f64> = TINKER_DELTAS.iter().map(|d| d.log10()).collect();
        let x = delta.log10();
        let alpha = 10f64.powf(-(0.75 / (delta / 75.0).log10()).powf(1.2));

        Ok(Self {
            big_a: interp(x, &log_deltas, &TINKER_A) * (1.0 + z).powf(-0.14),
            a: interp(x, &log_deltas, &TINKER_SMALL_A) * (1.0 + z).powf(-0.06),
            b: interp(x, &log_deltas, &TINKER_B) * (1.0 + z).powf(-alpha),
            c: interp(x, &log_deltas, &TINKER_C),
        })
    }

    /// The multiplicity function $f(\sigma)$.
    pub fn f_sigma(&self, sigma: f64) -> f64 {
        self.big_a * ((sigma / self.b).powf(-self.a) + 1.0) * (-self.c / (sigma * sigma)).exp()
    }
}

/// Fourier transform of the real-space top-hat window.
pub fn tophat_window(x: f64) -> f64 {
    if x < 1e-3 {
        1.0 - x * x / 10.0
    } else {
        3.0 * (x.sin() - x * x.cos()) / x.powi(3)
    }
}

/// Variance $\sigma^2(R)$ of the density field smoothed with a top-hat of radius `r`, given the
/// power spectrum `pk` at wavenumbers `k`.
pub fn sigma_squared(k: &[f64], pk: ArrayView1<f64>, r: f64) -> f64 {
    let lnk: Vec<f64> = k.iter().map(|k| k.ln()).collect();
    let integrand: Vec<f64> = k
        .iter()
        .zip(pk.iter())
        .map(|(k, p)| k.powi(3) * p * tophat_window(k * r).powi(2) / (2.0 * PI * PI))
        .collect();

    trapezoid(&lnk, &integrand)
}

/// Lagrangian radius of a mass `m` in a background of (comoving) density `rho`.
pub fn lagrangian_radius(m: f64, rho: f64) -> f64 {
    (3.0 * m / (4.0 * PI * rho)).cbrt()
}

/// The Tinker et al. (2008) mass function $\mathrm{d}n / \mathrm{d}\ln M$ at one redshift.
///
/// `rho_mean0` is the comoving mean matter density, `delta` the overdensity with respect to it
/// and `pk` the linear power spectrum at `z` sampled at `k`.
pub fn dn_dlnm(
    masses: ArrayView1<f64>,
    z: f64,
    rho_mean0: f64,
    delta: f64,
    k: &[f64],
    pk: ArrayView1<f64>,
) -> Result<Array1<f64>> {
    let tinker = TinkerParameters::new(delta, z)?;
    let ln_sigma = |m: f64| 0.5 * sigma_squared(k, pk, lagrangian_radius(m, rho_mean0)).ln();

    masses
        .iter()
        .map(|&m| {
            let sigma = ln_sigma(m).exp();
            let dln_sigma_dlnm =
                (ln_sigma(m * DLNM.exp()) - ln_sigma(m * (-DLNM).exp())) / (2.0 * DLNM);
            let value = tinker.f_sigma(sigma) * rho_mean0 / m * (-dln_sigma_dlnm);

            if value.is_finite() {
                Ok(value)
            } else {
                Err(Error::numerical(format!(
                    "non-finite mass function at M = {:e}, z = {}",
                    m, z
                )))
            }
        })
        .collect()
}

/// Radius enclosing a mean density of `delta` times the critical density at `z`.
pub fn rdel_c(cosmology: &CosmologyParameters, m: f64, z: f64, delta: f64) -> f64 {
    (3.0 * m / (4.0 * PI * delta * cosmology.rho_crit(z))).cbrt()
}

/// Dimensionless NFW mass profile $\ln(1+x) - x/(1+x)$.
fn nfw_mass(x: f64) -> f64 {
    (1.0 + x).ln() - x / (1.0 + x)
}

/// Concentration $c_{200c}$ of Duffy et al. (2008) for the full halo sample.
pub fn duffy_c200c(m200c: f64, z: f64) -> f64 {
    5.71 * (m200c / 2e12).powf(-0.084) * (1.0 + z).powf(-0.47)
}

/// An NFW halo defined by its scale radius and characteristic density.
#[derive(Clone, Copy, Debug)]
struct NfwHalo {
    rs: f64,
    rho_s: f64,
}

impl NfwHalo {
    fn from_m200c(cosmology: &CosmologyParameters, m200c: f64, z: f64) -> Self {
        let c = duffy_c200c(m200c, z);
        let rs = rdel_c(cosmology, m200c, z, 200.0) / c;
        let rho_s = m200c / (4.0 * PI * rs.powi(3) * nfw_mass(c));

        Self { rs, rho_s }
    }

    fn enclosed_mass(&self, r: f64) -> f64 {
        4.0 * PI * self.rho_s * self.rs.powi(3) * nfw_mass(r / self.rs)
    }

    fn mean_density(&self, r: f64) -> f64 {
        self.enclosed_mass(r) / (4.0 / 3.0 * PI * r.powi(3))
    }
}

/// Find a root of `f` in `[lo, hi]` by bisection.
fn bisect<F: Fn(f64) -> f64>(f: F, mut lo: f64, mut hi: f64) -> Result<f64> {
    let mut f_lo = f(lo);
    if f_lo * f(hi) > 0.0 {
        return Err(Error::numerical(format!(
            "no sign change of the mass-conversion residual in [{:e}, {:e}]",
            lo, hi
        )));
    }

    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);

        if f_mid == 0.0 || (hi - lo) < 1e-10 * mid.abs() {
            return Ok(mid);
        }

        if f_lo * f_mid < 0.0 {
            hi = mid;
        } else {
            lo = mid;
            f_lo = f_mid;
        }
    }

    Ok(0.5 * (lo + hi))
}

/// Convert $M_{500c}$ into $M_{200m}$ assuming an NFW profile with the Duffy et al. concentration.
pub fn m500c_to_m200m(cosmology: &CosmologyParameters, m500c: f64, z: f64) -> Result<f64> {
    let r500c = rdel_c(cosmology, m500c, z, 500.0);

    // the NFW halo whose enclosed mass within r500c equals m500c
    let m200c = bisect(
        |m| NfwHalo::from_m200c(cosmology, m, z).enclosed_mass(r500c) / m500c - 1.0,
        m500c,
        4.0 * m500c,
    )?;
    let halo = NfwHalo::from_m200c(cosmology, m200c, z);

    let target = 200.0 * cosmology.rho_mean(z);
    let r200c = rdel_c(cosmology, m200c, z, 200.0);
    let r200m = bisect(|r| halo.mean_density(r) / target - 1.0, 0.5 * r200c, 10.0 * r200c)?;

    Ok(halo.enclosed_mass(r200m))
}

/// Halo mass function and volume element of a cosmology, backed by a power spectrum oracle.
pub struct HaloMassFunction<'a, O: ?Sized> {
    cosmology: CosmologyParameters,
    oracle: &'a O,
}

impl<'a, O> HaloMassFunction<'a, O>
where
    O: PowerSpectrumOracle + ?Sized,
{
    /// Constructor.
    pub fn new(cosmology: CosmologyParameters, oracle: &'a O) -> Self {
        Self { cosmology, oracle }
    }

    /// The cosmology of this mass function.
    pub fn cosmology(&self) -> &CosmologyParameters {
        &self.cosmology
    }

    /// The oracle backing this mass function.
    pub fn oracle(&self) -> &'a O {
        self.oracle
    }

    /// The power spectrum at `zs`, normalized to the $\sigma_8$ of the target cosmology.
    ///
    /// The backend may use its own amplitude, so the spectrum is rescaled by
    /// $(\sigma_8 / \sigma_8^\mathrm{backend})^2$, where the backend's value is taken at $z = 0$.
    pub fn matter_power(&self, zs: &[f64]) -> Result<MatterPower> {
        let mut request = Vec::with_capacity(zs.len() + 1);
        request.push(0.0);
        request.extend_from_slice(zs);

        let mut power = self.oracle.matter_power(&self.cosmology, &request)?;
        power.check(&request)?;

        let fac = (self.cosmology.s8 / power.sigma8[0]).powi(2);
        if !fac.is_finite() {
            return Err(Error::numerical("backend sigma8 at z = 0 vanishes"));
        }

        Ok(MatterPower {
            k: power.k,
            pk: power.pk.slice_axis(Axis(0), (1..).into()).to_owned() * fac,
            sigma8: power.sigma8.slice_axis(Axis(0), (1..).into()).to_owned() * fac.sqrt(),
        })
    }

    /// Differential abundance $\mathrm{d}n / \mathrm{d}M$.
    ///
    /// `masses` has one column per redshift in `zs`; the result has the same shape. `delta` is an
    /// overdensity with respect to the mean matter density and must lie within the Tinker fit,
    /// $200 \le \Delta \le 3200$; critical overdensities such as $M_{500c}$ have to be converted
    /// first, see [`m500c_to_m200m`].
    pub fn dn_dm(&self, masses: &Array2<f64>, zs: &[f64], delta: f64) -> Result<Array2<f64>> {
        if masses.ncols() != zs.len() {
            return Err(Error::config(format!(
                "mass array has {} columns for {} redshifts",
                masses.ncols(),
                zs.len()
            )));
        }

        let power = self.matter_power(zs)?;
        let k = power.k.to_vec();
        let rho = self.cosmology.rho_mean0();

        let mut result = Array2::zeros(masses.dim());
        for (j, &z) in zs.iter().enumerate() {
            let column = dn_dlnm(masses.column(j), z, rho, delta, &k, power.pk.row(j))?;
            let dn_dm = column / &masses.column(j);
            result.column_mut(j).assign(&dn_dm);
        }

        Ok(result)
    }

    /// Comoving volume element per steradian, $\mathrm{d}V / \mathrm{d}z\,\mathrm{d}\Omega$, in
    /// $(h^{-1}\,\mathrm{Mpc})^3$.
    pub fn dv_dz(&self, zs: &[f64]) -> Result<Array1<f64>> {
        let h = self.cosmology.h();
        let c = self.cosmology.constants.c_km_s();

        zs.iter()
            .map(|&z| {
                let da = self.oracle.angular_diameter_distance(&self.cosmology, z)?;
                let hz = self.oracle.hubble_rate(&self.cosmology, z)?;

                let value = da * da * (1.0 + z).powi(2) * c / hz * h.powi(3);
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(Error::numerical(format!("non-finite volume element at z = {}", z)))
                }
            })
            .collect()
    }

    /// Raw cluster number density $4\pi\,\mathrm{d}n/\mathrm{d}M\,\mathrm{d}V/\mathrm{d}z$, not
    /// convolved with any observable.
    ///
    /// The first entry of `zs` only serves as the lower edge; the result has one column less than
    /// `zs`.
    pub fn n_of_mz(&self, masses: &[f64], zs: &[f64], delta: f64) -> Result<Array2<f64>> {
        if zs.len() < 2 {
            return Err(Error::config("N(M, z) needs at least two redshifts"));
        }

        let grid = Array2::from_shape_fn((masses.len(), zs.len()), |(i, _)| masses[i]);
        let dn_dm = self.dn_dm(&grid, zs, delta)?;
        let dv_dz = self.dv_dz(zs)?;

        let mut result = dn_dm.slice_axis(Axis(1), (1..).into()).to_owned();
        for (mut column, dv) in result.axis_iter_mut(Axis(1)).zip(dv_dz.iter().skip(1)) {
            column *= *dv * 4.0 * PI;
        }

        Ok(result)
    }

    /// Angular diameter distance in $h^{-1}\,\mathrm{Mpc}$.
    pub fn angular_diameter_distance(&self, z: f64) -> Result<f64> {
        Ok(self.oracle.angular_diameter_distance(&self.cosmology, z)? * self.cosmology.h())
    }

    /// Weights $4\pi\,\mathrm{d}n/\mathrm{d}M_{200m}\,\Delta M_{200m}\,\mathrm{d}V/\mathrm{d}z\,
    /// \Delta z$ and mean signals $\bar Y$ of every (mass, redshift) bin of an SZ survey.
    fn sz_bins(
        &self,
        mass_grid: &MassGrid,
        z_grid: &RedshiftGrid,
        relation: &ScalingRelation,
        scatter: &ScatterGrid,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let shape = (mass_grid.bins(), z_grid.bins());
        if scatter.siggrid.dim() != shape {
            return Err(Error::config(format!(
                "scatter grid has shape {:?}, the survey grid {:?}",
                scatter.siggrid.dim(),
                shape
            )));
        }

        let m500 = mass_grid.centers();
        let edges: Vec<f64> = mass_grid
            .mexp_edges()
            .iter()
            .map(|e| 10f64.powf(*e))
            .collect();
        let zs = z_grid.centers().to_vec();
        let dz = z_grid.widths();

        let mut m200 = Array2::zeros(shape);
        let mut dm200 = Array2::zeros(shape);

        for (j, &z) in zs.iter().enumerate() {
            let converted = edges
                .iter()
                .map(|m| m500c_to_m200m(&self.cosmology, *m, z))
                .collect::<Result<Vec<_>>>()?;

            for i in 0..shape.0 {
                m200[[i, j]] = m500c_to_m200m(&self.cosmology, m500[i], z)?;
                dm200[[i, j]] = converted[i + 1] - converted[i];
            }
        }

        let dn_dm = self.dn_dm(&m200, &zs, 200.0)?;
        let dv_dz = self.dv_dz(&zs)?;

        let mut weights = dn_dm * &dm200;
        let mut y_mean = Array2::zeros(shape);

        for (j, &z) in zs.iter().enumerate() {
            let da = self.angular_diameter_distance(z)?;
            weights.column_mut(j).mapv_inplace(|w| w * dv_dz[j] * 4.0 * PI * dz[j]);

            for i in 0..shape.0 {
                y_mean[[i, j]] = relation.y_m(&self.cosmology, m500[i], z, da);
            }
        }

        Ok((weights, y_mean))
    }

    /// Full-sky number of clusters per redshift bin that pass the detection threshold of
    /// `relation`.
    ///
    /// Masses of `mass_grid` are $M_{500c}$; `scatter` holds $\sigma_N$ at the bin centres.
    pub fn n_of_z_sz(
        &self,
        mass_grid: &MassGrid,
        z_grid: &RedshiftGrid,
        relation: &ScalingRelation,
        scatter: &ScatterGrid,
    ) -> Result<Array1<f64>> {
        let (weights, y_mean) = self.sz_bins(mass_grid, z_grid, relation, scatter)?;

        let mut result = Array1::zeros(z_grid.bins());
        for ((i, j), w) in weights.indexed_iter() {
            result[j] += w * relation.p_of_q(y_mean[[i, j]], scatter.siggrid[[i, j]])?;
        }

        Ok(result)
    }

    /// Full-sky cluster counts binned in mass, redshift and signal-to-noise, with the $q$ bins
    /// given by `q_edges`.
    pub fn n_of_mzq_sz(
        &self,
        mass_grid: &MassGrid,
        z_grid: &RedshiftGrid,
        q_edges: &[f64],
        relation: &ScalingRelation,
        scatter: &ScatterGrid,
    ) -> Result<Array3<f64>> {
        if q_edges.len() < 2 || q_edges.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::config("q edges must be strictly increasing"));
        }

        let (weights, y_mean) = self.sz_bins(mass_grid, z_grid, relation, scatter)?;
        let (nm, nz) = weights.dim();
        let mut result = Array3::zeros((nm, nz, q_edges.len() - 1));

        for ((i, j), w) in weights.indexed_iter() {
            for (k, q) in q_edges.windows(2).enumerate() {
                let p = relation.p_of_q_bin(y_mean[[i, j]], scatter.siggrid[[i, j]], q[0], q[1])?;
                result[[i, j, k]] = w * p;
            }
        }

        debug!("SZ-selected clusters on the full sky: {:.1}", result.sum());

        Ok(result)
    }
}
