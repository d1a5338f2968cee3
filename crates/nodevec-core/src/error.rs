//! Error taxonomy shared by the store, the index and the serving layer.

use thiserror::Error;

use crate::format::FormatError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: element {index} is not finite")]
    InvalidVector { index: usize },

    #[error("Invalid k: must be at least 1, got {0}")]
    InvalidK(usize),

    #[error("Snapshot {snapshot_id} has no live records to index")]
    EmptySnapshot { snapshot_id: u64 },

    #[error("Build of snapshot {snapshot_id} was aborted")]
    BuildAborted { snapshot_id: u64 },

    #[error("No index generation has been promoted yet")]
    NoIndexAvailable,

    #[error("Invalid store dimension: {0}")]
    InvalidDimension(usize),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors worth retrying with backoff. Caller errors and cancellations are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BuildFailed(_) | Error::Io(_))
    }

    /// Short stable name used in metric events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::InvalidVector { .. } => "invalid_vector",
            Error::InvalidK(_) => "invalid_k",
            Error::EmptySnapshot { .. } => "empty_snapshot",
            Error::BuildAborted { .. } => "build_aborted",
            Error::NoIndexAvailable => "no_index_available",
            Error::InvalidDimension(_) => "invalid_dimension",
            Error::BuildFailed(_) => "build_failed",
            Error::Format(_) => "format",
            Error::Io(_) => "io",
        }
    }
}
