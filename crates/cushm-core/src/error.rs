//! Error types for cushm

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("shared memory segment missing for key '{0}'")]
    SegmentMissing(String),

    #[error("malformed record {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("size mismatch for '{key}': descriptor needs {expected} bytes, segment has {actual}")]
    SizeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("access denied: view is read-only")]
    ReadOnly,

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("invalid project name '{0}'")]
    InvalidProjectName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the "nothing there" family: a missing record or segment.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::SegmentMissing(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
