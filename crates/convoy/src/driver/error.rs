//! Driver error types.

use std::time::Duration;

use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The underlying process or connection is gone. Never recovers.
    #[error("driver is gone: {0}")]
    Fatal(String),

    /// A bounded call ran out of time.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The driver answered with something we could not interpret.
    #[error("driver protocol error: {0}")]
    Protocol(String),

    /// The driver understood the request and refused it.
    #[error("driver rejected {operation}: {message}")]
    Rejected { operation: String, message: String },

    /// `close()` was already called.
    #[error("driver is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Whether the driver must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Fatal(_) | DriverError::Closed)
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        DriverError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}
