//! Error types for the lidarsim engine.

use crate::device::Status;
use crate::graph::Field;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Device allocation failed (out of device memory)
    #[error("Out of device memory in {call}")]
    OutOfMemory { call: &'static str },

    /// A device runtime or ray-tracing backend call returned a failure status
    #[error("{call} failed: {status}")]
    Backend { call: &'static str, status: Status },

    /// Graph configuration cannot be satisfied (missing input, missing field, cycle)
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Requested field is not produced by the node nor by any of its inputs
    #[error("Field {field} not found (requested from {node})")]
    FieldNotFound { node: &'static str, field: Field },

    /// Feature is present but disabled by policy
    #[error("Feature disabled: {0}")]
    FeatureDisabled(&'static str),

    /// Element type mismatch on typed buffer access
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Invalid argument passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map a failing runtime status for `call` into an engine error.
    pub fn from_status(call: &'static str, status: Status) -> Self {
        match status {
            Status::OutOfMemory => Self::OutOfMemory { call },
            status => Self::Backend { call, status },
        }
    }

    /// Create an invalid pipeline (configuration) error.
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::InvalidPipeline(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Runtime status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::OutOfMemory { .. } => Some(Status::OutOfMemory),
            Self::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Converts runtime `Result<T, Status>` values into engine results, naming the call.
pub trait CheckStatus<T> {
    fn checked(self, call: &'static str) -> Result<T>;
}

impl<T> CheckStatus<T> for std::result::Result<T, Status> {
    #[inline]
    fn checked(self, call: &'static str) -> Result<T> {
        self.map_err(|status| Error::from_status(call, status))
    }
}
