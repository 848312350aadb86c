//! Error taxonomy for the calibration pipeline.
//!
//! Parse and I/O failures abort the run they occur in. A singular normal-equation
//! solve is reported per coordinate and does not stop processing. Degenerate vertex
//! geometry is not an error at all: it shows up as non-finite numbers that the
//! association windows reject.

use std::path::PathBuf;

use thiserror::Error;

use crate::matrix::TargetCoordinate;

/// Errors produced by the optics calibration library.
#[derive(Error, Debug)]
pub enum OpticsError {
    /// A matrix file line could not be parsed.
    #[error("{path}:{line}: {reason}")]
    Format {
        path: String,
        line: usize,
        reason: String,
    },

    /// A file could not be opened, read or written.
    #[error("cannot access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The calibration configuration is malformed or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An event file could not be decoded.
    #[error("event file error: {0}")]
    Csv(#[from] csv::Error),

    /// The normal-equation system for one target coordinate is singular.
    #[error("singular fit for {coordinate}: rank {rank} of {size}")]
    SingularFit {
        coordinate: TargetCoordinate,
        rank: usize,
        size: usize,
    },
}

impl OpticsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OpticsError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: &str, line: usize, reason: impl Into<String>) -> Self {
        OpticsError::Format {
            path: path.to_string(),
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OpticsError>;
