//! Types exchanged with remote client drivers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a tenant wants to authenticate a new device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuthMethod {
    #[default]
    #[serde(rename = "qr")]
    Qr,
    #[serde(rename = "code", alias = "pairing_code")]
    PairingCode,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Qr => "qr",
            AuthMethod::PairingCode => "code",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qr" => Ok(AuthMethod::Qr),
            "code" | "pairing_code" => Ok(AuthMethod::PairingCode),
            _ => Err(format!("unknown auth method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Qr,
    PairingCode,
}

impl ChallengeKind {
    pub fn satisfies(&self, method: AuthMethod) -> bool {
        matches!(
            (self, method),
            (ChallengeKind::Qr, AuthMethod::Qr) | (ChallengeKind::PairingCode, AuthMethod::PairingCode)
        )
    }
}

/// A QR payload or pairing code, stamped with when we received it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

impl Challenge {
    pub fn new(kind: ChallengeKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn qr(value: impl Into<String>) -> Self {
        Self::new(ChallengeKind::Qr, value)
    }

    pub fn pairing_code(value: impl Into<String>) -> Self {
        Self::new(ChallengeKind::PairingCode, value)
    }

    /// Whether this challenge is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.issued_at);
        age.to_std().is_ok_and(|age| age > max_age)
    }
}

/// Notifications pushed by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A new or rotated challenge.
    Challenge(Challenge),
    Authenticated,
    /// Fully synced and able to publish.
    Ready,
    /// The remote side revoked this device.
    LoggedOut,
    Disconnected { reason: String },
    /// Raw connection state string from the remote client.
    StateChanged { state: String },
}

/// Result of a lightweight liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub connected: bool,
    #[serde(default)]
    pub state: String,
}

/// Publish operation types, each with its own call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishKind {
    Text,
    Media,
    Status,
    Reaction,
}

impl PublishKind {
    pub fn default_timeout(&self) -> Duration {
        match self {
            PublishKind::Text => Duration::from_secs(10),
            PublishKind::Media => Duration::from_secs(20),
            PublishKind::Status => Duration::from_secs(15),
            PublishKind::Reaction => Duration::from_secs(5),
        }
    }
}

impl fmt::Display for PublishKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishKind::Text => write!(f, "text"),
            PublishKind::Media => write!(f, "media"),
            PublishKind::Status => write!(f, "status"),
            PublishKind::Reaction => write!(f, "reaction"),
        }
    }
}

/// One publish request. The payload is opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOp {
    pub kind: PublishKind,
    #[serde(default)]
    pub payload: Value,
}

impl PublishOp {
    pub fn new(kind: PublishKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}
