//! Session orchestration.
//!
//! [`SessionOrchestrator`] is the entry point for the API layer: it ties the
//! registry, the isolation allocator and one automation agent per session
//! together, and owns every teardown path.

mod error;
mod service;

pub use error::{OrchestratorError, OrchestratorResult};
pub use service::{RestoreReport, SessionOrchestrator, TenantRemoval};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::auth::AuthConfig;

/// Orchestrator policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sessions a tenant may hold at once. The tenant's data directory is
    /// shared by all of them.
    pub max_sessions_per_user: usize,
    /// Stored challenges older than this are fetched again on request.
    #[serde(with = "humantime_serde")]
    pub challenge_max_age: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 1,
            challenge_max_age: Duration::from_secs(60),
        }
    }
}

/// Everything the orchestrator hands down to the sessions it creates.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub orchestrator: OrchestratorConfig,
    pub auth: AuthConfig,
    pub agent: AgentConfig,
}
