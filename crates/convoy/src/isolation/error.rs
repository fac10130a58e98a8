//! Isolation allocator error types.

use thiserror::Error;

use crate::container::ContainerError;

pub type IsolationResult<T> = Result<T, IsolationError>;

#[derive(Debug, Error)]
pub enum IsolationError {
    /// Every address in the configured range is held by a live slot.
    #[error("address pool exhausted ({capacity} slots in use)")]
    AllocationExhausted { capacity: usize },

    #[error("invalid user id '{0}'")]
    InvalidUserId(String),

    #[error("invalid isolation config: {0}")]
    InvalidConfig(String),

    #[error("no slot allocated for user '{0}'")]
    SlotNotFound(String),

    #[error("slot for user '{0}' is still allocated")]
    SlotInUse(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
