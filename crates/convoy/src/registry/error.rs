//! Registry error types.

use thiserror::Error;

use super::models::SessionStatus;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {session_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session {session_id}: cannot attach a challenge while {status}")]
    AuthDataNotAllowed {
        session_id: String,
        status: SessionStatus,
    },
}
