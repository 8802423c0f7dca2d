//! Crate-wide error type.
//!
//! Most variants are logged and absorbed by their caller rather than
//! propagated to the process. The type exists mainly to give callers a
//! concrete `Result` to match on at the handful of places where the *kind*
//! of failure changes behavior (no schema match is fatal to a pass;
//! everything else is not).

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WriterError>;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no storage schema matched metric '{metric}'")]
    NoStorageSchema { metric: String },

    #[error("failed to parse schema file {path}: {reason}")]
    SchemaParse { path: PathBuf, reason: String },

    #[error("unsupported metadata key '{0}'")]
    UnsupportedMetadataKey(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WriterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// `true` for the one error kind the writer's outer loop treats as fatal
    /// to the *current pass* rather than to the process as a whole.
    pub fn is_fatal_to_pass(&self) -> bool {
        matches!(self, WriterError::NoStorageSchema { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_storage_schema_is_fatal_to_pass() {
        let err = WriterError::NoStorageSchema { metric: "a.b.c".into() };
        assert!(err.is_fatal_to_pass());
    }

    #[test]
    fn backend_error_is_not_fatal_to_pass() {
        let err = WriterError::Backend("disk full".into());
        assert!(!err.is_fatal_to_pass());
    }
}
