//! Authentication lifecycle for one session.
//!
//! [`AuthStateMachine`] walks a session from `initializing` through a
//! challenge to `ready`, writing every step into the registry. All waits are
//! bounded by [`AuthConfig`].

mod machine;

pub use machine::{AuthStart, AuthStateMachine};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::DriverError;
use crate::registry::RegistryError;

/// Authentication budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long to wait for the driver to push a QR challenge.
    #[serde(with = "humantime_serde")]
    pub qr_event_window: Duration,
    /// How long to keep asking the driver for a QR challenge after the
    /// event window passed without one.
    #[serde(with = "humantime_serde")]
    pub scrape_fallback_window: Duration,
    /// Budget for requesting a pairing code.
    #[serde(with = "humantime_serde")]
    pub pairing_window: Duration,
    /// Budget from challenge issuance to confirmed authentication.
    #[serde(with = "humantime_serde")]
    pub auth_budget: Duration,
    /// Budget from authentication to a fully synced client.
    #[serde(with = "humantime_serde")]
    pub ready_budget: Duration,
    /// Slice length for waits and fallback polling.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            qr_event_window: Duration::from_secs(10),
            scrape_fallback_window: Duration::from_secs(5),
            pairing_window: Duration::from_secs(10),
            auth_budget: Duration::from_secs(90),
            ready_budget: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Which confirmation a session was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Authentication,
    Ready,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPhase::Authentication => f.write_str("authentication"),
            AuthPhase::Ready => f.write_str("ready"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{phase} not confirmed within {budget:?}")]
    Timeout { phase: AuthPhase, budget: Duration },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type AuthResult<T> = Result<T, AuthError>;
