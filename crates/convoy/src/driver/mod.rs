//! Remote client drivers.
//!
//! A driver owns one persistent connection to the remote service for one
//! session. The orchestrator treats it as a black box behind
//! [`RemoteClientDriver`]; everything about locating UI elements or retrying
//! publish strategies stays on the driver's side of this boundary.

mod error;
mod process;
mod types;
mod wire;

pub use error::{DriverError, DriverResult};
pub use process::{ProcessDriver, ProcessDriverFactory};
pub use types::{
    AuthMethod, Challenge, ChallengeKind, DriverEvent, ProbeReport, PublishKind, PublishOp,
};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::isolation::IsolationSlot;

/// One exclusive, stateful connection. Calls must not overlap; callers
/// serialize access.
#[async_trait]
pub trait RemoteClientDriver: Send {
    /// Open the connection using the slot's data directory.
    async fn initialize(&mut self, slot: &IsolationSlot) -> DriverResult<()>;

    /// Whether persisted credentials already authenticate this client.
    async fn check_authenticated(&mut self) -> DriverResult<bool>;

    /// Actively fetch a challenge. `Ok(None)` means none is available yet.
    async fn issue_challenge(
        &mut self,
        method: AuthMethod,
        phone: Option<&str>,
    ) -> DriverResult<Option<Challenge>>;

    /// Block until authenticated or `timeout` elapses.
    async fn wait_authenticated(&mut self, timeout: Duration) -> DriverResult<bool>;

    /// Block until fully synced or `timeout` elapses.
    async fn wait_ready(&mut self, timeout: Duration) -> DriverResult<bool>;

    /// Identity of the authenticated account, once known.
    async fn phone_number(&mut self) -> DriverResult<Option<String>>;

    /// `timeout` is the caller's budget for this operation.
    async fn publish(&mut self, op: &PublishOp, timeout: Duration) -> DriverResult<Value>;

    async fn probe(&mut self) -> DriverResult<ProbeReport>;

    /// Runtime memory usage as a fraction of its limit (0.0..=1.0).
    async fn memory_usage(&mut self) -> DriverResult<f64>;

    /// Free cached resources in place.
    async fn release_memory(&mut self) -> DriverResult<()>;

    /// Hand out the event stream. Returns `Some` exactly once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<DriverEvent>>;

    async fn close(&mut self) -> DriverResult<()>;
}

/// Builds fresh driver instances bound to a slot.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, slot: &IsolationSlot) -> DriverResult<Box<dyn RemoteClientDriver>>;
}

/// Driver process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Driver executable, spawned once per session.
    pub binary: String,
    /// Extra arguments placed before the slot arguments.
    pub args: Vec<String>,
    /// Budget for a single request/response exchange.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long `close` waits for the process to exit before killing it.
    #[serde(with = "humantime_serde")]
    pub exit_timeout: Duration,
    /// Buffered events per driver before new ones are dropped.
    pub event_buffer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            binary: "convoy-driver".to_string(),
            args: Vec::new(),
            request_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}
