//! Orchestrator error types.

use std::time::Duration;

use thiserror::Error;

use crate::auth::{AuthError, AuthPhase};
use crate::driver::DriverError;
use crate::isolation::IsolationError;
use crate::registry::{RegistryError, SessionStatus};

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No address left in the pool. The pool is unchanged.
    #[error("no isolation slots left ({capacity} in use)")]
    AllocationExhausted { capacity: usize },

    /// Recoverable; fetch the challenge again.
    #[error("session {session_id}: no challenge available yet")]
    ChallengeTimeout { session_id: String },

    /// The session was failed and removed.
    #[error("session {session_id}: {phase} not confirmed within {budget:?}")]
    AuthenticationTimeout {
        session_id: String,
        phase: AuthPhase,
        budget: Duration,
    },

    /// The driver is gone. The session was removed; its data is kept.
    #[error("session {session_id}: driver unresponsive")]
    DriverUnresponsive { session_id: String },

    /// The previous driver is still serving.
    #[error("session {session_id}: context refresh failed: {reason}")]
    RefreshFailed { session_id: String, reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("user {user_id} already has {limit} active session(s)")]
    SessionLimitReached { user_id: String, limit: usize },

    #[error("session {session_id} is {status}, not ready")]
    NotReady {
        session_id: String,
        status: SessionStatus,
    },

    #[error("session {session_id} is {status}, not awaiting authentication")]
    NotAwaitingAuth {
        session_id: String,
        status: SessionStatus,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Isolation(IsolationError),

    #[error(transparent)]
    Registry(RegistryError),

    #[error("session store: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub(super) fn from_auth(session_id: &str, err: AuthError) -> Self {
        match err {
            AuthError::Timeout { phase, budget } => OrchestratorError::AuthenticationTimeout {
                session_id: session_id.to_string(),
                phase,
                budget,
            },
            AuthError::Driver(err) if err.is_fatal() => OrchestratorError::DriverUnresponsive {
                session_id: session_id.to_string(),
            },
            AuthError::Driver(err) => OrchestratorError::Driver(err),
            AuthError::Registry(err) => err.into(),
        }
    }
}

impl From<IsolationError> for OrchestratorError {
    fn from(err: IsolationError) -> Self {
        match err {
            IsolationError::AllocationExhausted { capacity } => {
                OrchestratorError::AllocationExhausted { capacity }
            }
            other => OrchestratorError::Isolation(other),
        }
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(session_id) => OrchestratorError::SessionNotFound(session_id),
            other => OrchestratorError::Registry(other),
        }
    }
}
