//! Per-tenant isolation.
//!
//! Each tenant gets one [`IsolationSlot`]: a unique address from a bounded
//! pool, a port derived from that address, private data/state directories and
//! (in container mode) a long-lived backing container. Slots outlive sessions;
//! only explicit tenant removal releases one.

mod allocator;
mod error;
mod pool;
mod slot;

pub use allocator::{IsolationAllocator, ReconcileReport};
pub use error::{IsolationError, IsolationResult};
pub use pool::{AddressPool, AddressRange, Lease};
pub use slot::{IsolationSlot, SLOT_FILE, validate_user_id};

use serde::{Deserialize, Serialize};

use crate::container::RuntimeType;

/// Container labels used to recover slots from live runtimes.
pub const LABEL_MANAGED: &str = "convoy.managed";
pub const LABEL_USER: &str = "convoy.user_id";
pub const LABEL_ADDRESS: &str = "convoy.address";
pub const LABEL_PORT: &str = "convoy.port";

/// How slots are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// One container per tenant.
    #[default]
    Container,
    /// Address/port bookkeeping only; drivers run on the host.
    Local,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Container => write!(f, "container"),
            IsolationMode::Local => write!(f, "local"),
        }
    }
}

/// Isolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub mode: IsolationMode,
    /// Container runtime; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Custom path to the runtime binary.
    pub runtime_binary: Option<String>,
    /// Image for tenant containers.
    pub image: String,
    /// User-defined network for static addresses. Without it containers get
    /// runtime-assigned addresses and only the port mapping matters.
    pub network: Option<String>,
    /// Container names are `{container_prefix}-{user_id}`.
    pub container_prefix: String,
    /// First two octets of every slot address.
    pub subnet_prefix: String,
    pub block_start: u8,
    pub block_end: u8,
    pub host_start: u8,
    pub host_end: u8,
    /// Port of the first address in the range.
    pub base_port: u16,
    /// Port the driver listens on inside the container.
    pub container_port: u16,
    /// Grace period for `stop` before a container is removed.
    pub stop_timeout_secs: u32,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mode: IsolationMode::Container,
            runtime: None,
            runtime_binary: None,
            image: "ghcr.io/convoy/driver:latest".to_string(),
            network: Some("convoy".to_string()),
            container_prefix: "convoy".to_string(),
            subnet_prefix: "10.89".to_string(),
            block_start: 0,
            block_end: 15,
            host_start: 2,
            host_end: 254,
            base_port: 40_000,
            container_port: 9_222,
            stop_timeout_secs: 10,
        }
    }
}

impl IsolationConfig {
    pub fn address_range(&self) -> IsolationResult<AddressRange> {
        Ok(AddressRange {
            prefix: AddressRange::parse_prefix(&self.subnet_prefix)?,
            block_start: self.block_start,
            block_end: self.block_end,
            host_start: self.host_start,
            host_end: self.host_end,
            base_port: self.base_port,
        })
    }

    pub fn container_name(&self, user_id: &str) -> String {
        format!("{}-{}", self.container_prefix, user_id)
    }
}
