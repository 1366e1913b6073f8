//! Error types for mltomo

use thiserror::Error;

/// Main error type for ML sub-tomogram averaging
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("Unsupported NIfTI volume: {0}")]
    NiftiFormat(String),

    #[error("Volume {index} has {got} voxels, expected {expected} ({dim}^3)")]
    DimensionMismatch {
        index: usize,
        dim: usize,
        expected: usize,
        got: usize,
    },

    #[error("Volume is not cubic: {nx}x{ny}x{nz}")]
    NotCubic { nx: usize, ny: usize, nz: usize },

    #[error("At least one reference is required")]
    NoReferences,

    #[error("No sub-volumes to process")]
    EmptyImageSet,

    #[error("Invalid missing region {id}: {reason}")]
    InvalidMissingRegion { id: usize, reason: String },

    #[error("Missing region {id} is a {found} region but the run expects {expected}")]
    MissingRegionKindMismatch {
        id: usize,
        expected: String,
        found: String,
    },

    #[error("Sub-volume {image} refers to unknown missing region {id}")]
    UnknownMissingRegion { image: usize, id: usize },

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Numerical failure on sub-volume {image}: {reason}")]
    Numerical { image: usize, reason: String },

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl Error {
    pub(crate) fn invalid_parameter(
        name: &'static str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidParameter {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for mltomo operations
pub type Result<T> = std::result::Result<T, Error>;
