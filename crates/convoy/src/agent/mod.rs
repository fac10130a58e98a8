//! Automation agents.
//!
//! One [`AutomationAgent`] per session: it owns the session's driver, serializes
//! every call against it, watches its memory and replaces it in place when it
//! grows too heavy or too old.

mod agent;
mod monitor;
mod refresh;

pub use agent::{AgentSnapshot, AutomationAgent};
pub use refresh::RefreshOutcome;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::DriverEvent;

/// Agent tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// How often an authenticated agent samples driver memory.
    #[serde(with = "humantime_serde")]
    pub memory_check_interval: Duration,
    /// Ratio at which the driver is asked to free cached resources.
    pub soft_memory_threshold: f64,
    /// Ratio at which the driver is replaced.
    pub hard_memory_threshold: f64,
    /// Age at which the driver is replaced regardless of memory.
    #[serde(with = "humantime_serde")]
    pub max_session_duration: Duration,
    /// How long a replacement driver gets to prove it is authenticated.
    #[serde(with = "humantime_serde")]
    pub refresh_budget: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_poll_interval: Duration,
    /// Budget for driver start-up.
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
    /// Budget for short driver calls (probe, memory, auth check).
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Overrides the per-kind publish budgets when set.
    #[serde(default, with = "humantime_serde")]
    pub publish_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            memory_check_interval: Duration::from_secs(30),
            soft_memory_threshold: 0.70,
            hard_memory_threshold: 0.85,
            max_session_duration: Duration::from_secs(6 * 60 * 60),
            refresh_budget: Duration::from_secs(30),
            refresh_poll_interval: Duration::from_secs(1),
            init_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(15),
            publish_timeout: None,
            close_timeout: Duration::from_secs(10),
        }
    }
}

/// Resource pressure on a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    /// Free caches in place.
    Soft,
    /// Replace the driver.
    Hard,
}

/// Classify a memory sample. Exceeding the maximum session duration counts
/// as hard pressure.
pub fn evaluate_pressure(ratio: f64, session_age: Duration, config: &AgentConfig) -> PressureLevel {
    if ratio >= config.hard_memory_threshold || session_age >= config.max_session_duration {
        PressureLevel::Hard
    } else if ratio >= config.soft_memory_threshold {
        PressureLevel::Soft
    } else {
        PressureLevel::Normal
    }
}

/// Notifications from an agent to whoever supervises it.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Rebroadcast of the current driver's events.
    Driver(DriverEvent),
    ResourcePressure {
        level: PressureLevel,
        ratio: f64,
    },
    CleanupPerformed {
        ratio: f64,
    },
    RefreshCompleted {
        generation: u64,
    },
    /// The old driver is still in charge.
    RefreshFailed {
        reason: String,
    },
    /// A call hit a fatal driver error. Sent at most once per agent.
    DriverLost {
        reason: String,
    },
}
