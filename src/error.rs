//! Error types shared by every stage of a forecast.
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a forecast unit.
///
/// None of these are retried: a configuration error is reported before any numerical work
/// starts, and a numerical instability points at corrupted upstream data.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or inconsistent configuration, e.g. a duplicated nuisance parameter.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A NaN, an infinity or an otherwise invalid value was found in a grid or integral.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    /// A derivative, fiducial or grid file that the forecast needs does not exist.
    #[error("missing artifact: {}", path.display())]
    MissingArtifact {
        /// Path that was expected to exist.
        path: PathBuf,
    },

    /// A persisted Fisher matrix with an extension that cannot be read.
    #[error("unsupported Fisher file format: {}", path.display())]
    UnsupportedFormat {
        /// Offending path.
        path: PathBuf,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Delimited-text error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Reading a `.npy` array failed.
    #[error("npy read error: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// Writing a `.npy` array failed.
    #[error("npy write error: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// Array shape mismatch
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn numerical<S: Into<String>>(msg: S) -> Self {
        Self::NumericalInstability(msg.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
