//! Mass, redshift and signal-to-noise binning together with the binned count grids.
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Edges `start, start + step, ...` up to and including `stop`, the way the `zrange`, `mexprange`
/// and `qrange` triples of a grid definition are expanded.
pub fn arange_edges(start: f64, stop: f64, step: f64) -> Result<Vec<f64>> {
    if !(step > 0.0) || !(stop > start) {
        return Err(Error::config(format!(
            "invalid range ({}, {}, {})",
            start, stop, step
        )));
    }

    let n = ((stop - start) / step + 1e-9).floor() as usize + 1;
    Ok((0..n).map(|i| start + i as f64 * step).collect())
}

/// Checks that `edges` has at least two entries, is strictly increasing and starts at a
/// non-negative value.
fn check_edges(edges: &[f64], what: &str, non_negative: bool) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::config(format!("{} needs at least two edges", what)));
    }

    if edges.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(Error::config(format!("{} edges must be strictly increasing", what)));
    }

    if non_negative && edges[0] < 0.0 {
        return Err(Error::config(format!("{} edges must start at zero or above", what)));
    }

    Ok(())
}

/// Log-spaced mass binning, defined by the edges of $\log_{10} M$.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MassGrid {
    mexp_edges: Vec<f64>,
}

impl MassGrid {
    /// Construct a mass grid from the edges of $\log_{10} M$.
    pub fn new(mexp_edges: Vec<f64>) -> Result<Self> {
        check_edges(&mexp_edges, "mass", false)?;
        Ok(Self { mexp_edges })
    }

    /// Edges of $\log_{10} M$.
    pub fn mexp_edges(&self) -> &[f64] {
        &self.mexp_edges
    }

    /// Number of mass bins.
    pub fn bins(&self) -> usize {
        self.mexp_edges.len() - 1
    }

    /// Linear masses at the bin centres in $\log_{10} M$.
    pub fn centers(&self) -> Array1<f64> {
        self.mexp_edges
            .windows(2)
            .map(|w| 10f64.powf(0.5 * (w[0] + w[1])))
            .collect()
    }

    /// Linear widths of the mass bins.
    pub fn widths(&self) -> Array1<f64> {
        self.mexp_edges
            .windows(2)
            .map(|w| 10f64.powf(w[1]) - 10f64.powf(w[0]))
            .collect()
    }
}

/// Redshift binning.
///
/// The edges are strictly increasing and the first one is not negative.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RedshiftGrid {
    edges: Vec<f64>,
}

impl RedshiftGrid {
    /// Construct a redshift grid, checking its invariants.
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        check_edges(&edges, "redshift", true)?;
        Ok(Self { edges })
    }

    /// The bin edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of redshift bins.
    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Bin centres.
    pub fn centers(&self) -> Array1<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    /// Bin widths $\Delta z$.
    pub fn widths(&self) -> Array1<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// Expected cluster counts binned in mass, redshift and signal-to-noise $q$.
///
/// A count grid never holds NaN, infinite or negative values; all are rejected by
/// [`CountGrid::new`].
#[derive(Clone, Debug, PartialEq)]
pub struct CountGrid {
    counts: Array3<f64>,
}

impl CountGrid {
    /// Wrap `counts`, indexed by (mass, redshift, q), after validating its entries.
    pub fn new(counts: Array3<f64>) -> Result<Self> {
        if let Some(index) = counts.iter().position(|v| !v.is_finite()) {
            return Err(Error::numerical(format!(
                "non-finite value in count grid at flat index {}",
                index
            )));
        }

        if let Some(value) = counts.iter().find(|v| **v < 0.0) {
            return Err(Error::numerical(format!(
                "negative expected count {} in count grid",
                value
            )));
        }

        Ok(Self { counts })
    }

    /// The counts themselves.
    pub fn counts(&self) -> &Array3<f64> {
        &self.counts
    }

    /// Destructure into the underlying array.
    pub fn into_inner(self) -> Array3<f64> {
        self.counts
    }

    /// Total expected number of clusters.
    pub fn total(&self) -> f64 {
        self.counts.sum()
    }

    /// Counts per redshift bin, summed over mass and $q$.
    pub fn per_redshift(&self) -> Array1<f64> {
        self.counts.sum_axis(Axis(2)).sum_axis(Axis(0))
    }
}

/// The intrinsic noise $\sigma_N(M, z)$ of the SZ observable, precomputed on a mass/redshift
/// grid and stored as JSON.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScatterGrid {
    /// Masses belonging to the rows of `siggrid`.
    pub mgrid: Array1<f64>,
    /// Redshifts belonging to the columns of `siggrid`.
    pub zgrid: Array1<f64>,
    /// $\sigma_N$ indexed by (mass, redshift).
    pub siggrid: Array2<f64>,
}

impl ScatterGrid {
    /// Read a scatter grid from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let grid: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;

        if grid.siggrid.dim() != (grid.mgrid.len(), grid.zgrid.len()) {
            return Err(Error::config(format!(
                "scatter grid {} has shape {:?}, expected ({}, {})",
                path.display(),
                grid.siggrid.dim(),
                grid.mgrid.len(),
                grid.zgrid.len()
            )));
        }

        Ok(grid)
    }

    /// Write the grid as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}
