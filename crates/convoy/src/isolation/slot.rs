//! Isolation slot record.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{IsolationError, IsolationResult};

/// File inside the state dir that records the slot's address, so a local-mode
/// restart can recover it without a container to inspect.
pub const SLOT_FILE: &str = "slot.json";

/// A tenant's exclusive runtime allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSlot {
    pub user_id: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Backing container, absent in local mode.
    pub container_name: Option<String>,
    /// Sessions currently running on this slot.
    #[serde(default)]
    pub bound_sessions: BTreeSet<String>,
    pub allocated_at: DateTime<Utc>,
}

impl IsolationSlot {
    pub fn is_bound(&self) -> bool {
        !self.bound_sessions.is_empty()
    }
}

/// On-disk record written to `{state_dir}/slot.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SlotRecord {
    pub user_id: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub allocated_at: DateTime<Utc>,
}

impl From<&IsolationSlot> for SlotRecord {
    fn from(slot: &IsolationSlot) -> Self {
        Self {
            user_id: slot.user_id.clone(),
            address: slot.address,
            port: slot.port,
            allocated_at: slot.allocated_at,
        }
    }
}

/// Tenant directory layout under the data root.
pub(crate) fn tenant_dir(root: &Path, user_id: &str) -> PathBuf {
    root.join("users").join(user_id)
}

pub(crate) fn tenant_dirs(root: &Path, user_id: &str) -> (PathBuf, PathBuf) {
    let base = tenant_dir(root, user_id);
    (base.join("data"), base.join("state"))
}

/// User ids become directory and container names.
pub fn validate_user_id(user_id: &str) -> IsolationResult<()> {
    let valid = !user_id.is_empty()
        && user_id.len() <= 64
        && user_id
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(IsolationError::InvalidUserId(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_validation() {
        assert!(validate_user_id("u1").is_ok());
        assert!(validate_user_id("alice.smith-2").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("../etc").is_err());
        assert!(validate_user_id(".hidden").is_err());
        assert!(validate_user_id("a b").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn tenant_layout() {
        let (data, state) = tenant_dirs(Path::new("/srv/convoy"), "u1");
        assert_eq!(data, PathBuf::from("/srv/convoy/users/u1/data"));
        assert_eq!(state, PathBuf::from("/srv/convoy/users/u1/state"));
    }
}
