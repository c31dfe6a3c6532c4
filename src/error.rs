//! Error taxonomy for operation handlers.
//!
//! Every downstream failure is classified into one of these variants
//! and returned as data. The dispatcher turns them into a failed
//! [`OperationResult`](crate::operations::OperationResult).

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// A classified handler failure.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Path {} is outside the confinement root {}", path.display(), root.display())]
    OutOfBoundsPath { path: PathBuf, root: PathBuf },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Subprocess failed during {step}: {reason}")]
    SubprocessFailed { step: VcsStep, reason: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Serializable discriminant of [`OperationError`], exposed in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidParameters,
    OutOfBoundsPath,
    NetworkError,
    SubprocessFailed,
    QueryError,
    DecodeError,
    ReadError,
    WriteError,
    UnsupportedOperation,
}

/// The version-control step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsStep {
    Clone,
    Write,
    Add,
    Commit,
    Log,
}

impl fmt::Display for VcsStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clone => "clone",
            Self::Write => "write",
            Self::Add => "add",
            Self::Commit => "commit",
            Self::Log => "log",
        };
        f.write_str(s)
    }
}

impl OperationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::OutOfBoundsPath { .. } => ErrorKind::OutOfBoundsPath,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::SubprocessFailed { .. } => ErrorKind::SubprocessFailed,
            Self::Query(_) => ErrorKind::QueryError,
            Self::Decode(_) => ErrorKind::DecodeError,
            Self::Read(_) => ErrorKind::ReadError,
            Self::Write(_) => ErrorKind::WriteError,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
        }
    }

    /// The failed step, for `SubprocessFailed` only.
    pub fn step(&self) -> Option<VcsStep> {
        match self {
            Self::SubprocessFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub(crate) fn missing(name: &str) -> Self {
        Self::InvalidParameters(format!("missing required parameter: {name}"))
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;
