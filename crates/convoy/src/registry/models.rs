//! Session registry data models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::{AuthMethod, Challenge, ChallengeKind};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, no driver yet.
    Created,
    /// Driver is starting.
    Initializing,
    /// Waiting for the tenant to answer a challenge.
    AwaitingAuth,
    /// Credentials accepted, still syncing.
    Authenticated,
    /// Able to publish.
    Ready,
    /// A publish is in flight.
    Active,
    /// Logged out remotely; a new challenge is needed.
    RequiresReauth,
    /// Terminal failure.
    Failed,
    /// Torn down.
    Removed,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 9] = [
        SessionStatus::Created,
        SessionStatus::Initializing,
        SessionStatus::AwaitingAuth,
        SessionStatus::Authenticated,
        SessionStatus::Ready,
        SessionStatus::Active,
        SessionStatus::RequiresReauth,
        SessionStatus::Failed,
        SessionStatus::Removed,
    ];

    /// Statuses in which a challenge payload may be attached.
    pub fn accepts_auth_data(&self) -> bool {
        matches!(self, SessionStatus::AwaitingAuth | SessionStatus::RequiresReauth)
    }

    /// Statuses in which publish operations are allowed.
    pub fn is_operational(&self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::Removed)
    }

    /// Whether `self -> next` is a legal edge. Staying put is always legal
    /// except out of `Removed`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if *self == Removed {
            return false;
        }
        if *self == next {
            return true;
        }

        match next {
            Removed | Initializing => true,
            Failed => !self.is_terminal(),
            AwaitingAuth => matches!(self, Initializing | RequiresReauth),
            Authenticated => matches!(self, Initializing | AwaitingAuth),
            Ready => matches!(self, Authenticated | Active),
            Active => matches!(self, Ready),
            RequiresReauth => matches!(self, Authenticated | Ready | Active),
            Created => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Initializing => "initializing",
            SessionStatus::AwaitingAuth => "awaiting_auth",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Ready => "ready",
            SessionStatus::Active => "active",
            SessionStatus::RequiresReauth => "requires_reauth",
            SessionStatus::Failed => "failed",
            SessionStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s.to_lowercase())
            .ok_or_else(|| format!("unknown session status: {}", s))
    }
}

/// Options supplied when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionOptions {
    pub auth_method: AuthMethod,
    /// Phone number for pairing-code authentication.
    pub phone: Option<String>,
}

impl CreateSessionOptions {
    pub fn qr() -> Self {
        Self::default()
    }

    pub fn pairing_code(phone: impl Into<String>) -> Self {
        Self {
            auth_method: AuthMethod::PairingCode,
            phone: Some(phone.into()),
        }
    }
}

/// Identity and current status of one tenant session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub user_id: String,
    pub auth_method: AuthMethod,
    pub requested_phone: Option<String>,
    pub status: SessionStatus,
    /// Present only while awaiting (re)authentication.
    pub auth_data: Option<Challenge>,
    /// Captured once the session reaches `ready`.
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SessionMetadata {
    pub fn new(session_id: String, user_id: String, options: CreateSessionOptions) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            auth_method: options.auth_method,
            requested_phone: options.phone,
            status: SessionStatus::Created,
            auth_data: None,
            phone_number: None,
            created_at: now,
            last_activity_at: now,
            error_message: None,
        }
    }

    pub fn options(&self) -> CreateSessionOptions {
        CreateSessionOptions {
            auth_method: self.auth_method,
            phone: self.requested_phone.clone(),
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> std::time::Duration {
        now.signed_duration_since(self.last_activity_at)
            .to_std()
            .unwrap_or_default()
    }

    /// `auth_data` implies a status that accepts it.
    pub fn invariants_hold(&self) -> bool {
        self.auth_data.is_none() || self.status.accepts_auth_data()
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Requested,
    Idle,
    AuthenticationTimeout,
    DriverUnresponsive,
    /// Displaced by a newer session of the same tenant.
    Evicted,
    TenantRemoved,
    /// Persisted as failed before a restart.
    Stale,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemovalReason::Requested => "requested",
            RemovalReason::Idle => "idle",
            RemovalReason::AuthenticationTimeout => "authentication_timeout",
            RemovalReason::DriverUnresponsive => "driver_unresponsive",
            RemovalReason::Evicted => "evicted",
            RemovalReason::TenantRemoved => "tenant_removed",
            RemovalReason::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications published on the registry's event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        session_id: String,
        user_id: String,
    },
    StatusChanged {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    ChallengeIssued {
        session_id: String,
        kind: ChallengeKind,
    },
    PhoneNumberCaptured {
        session_id: String,
        phone_number: String,
    },
    RefreshCompleted {
        session_id: String,
        generation: u64,
    },
    RefreshFailed {
        session_id: String,
        reason: String,
    },
    SlotUnhealthy {
        user_id: String,
    },
    Removed {
        session_id: String,
        reason: RemovalReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Created { session_id, .. }
            | SessionEvent::StatusChanged { session_id, .. }
            | SessionEvent::ChallengeIssued { session_id, .. }
            | SessionEvent::PhoneNumberCaptured { session_id, .. }
            | SessionEvent::RefreshCompleted { session_id, .. }
            | SessionEvent::RefreshFailed { session_id, .. }
            | SessionEvent::Removed { session_id, .. } => Some(session_id),
            SessionEvent::SlotUnhealthy { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in SessionStatus::ALL {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&SessionStatus::RequiresReauth).unwrap(),
            "\"requires_reauth\""
        );
    }

    #[test]
    fn auth_cycle_edges() {
        use SessionStatus::*;
        let path = [Created, Initializing, AwaitingAuth, Authenticated, Ready, Active, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Initializing.can_transition_to(Authenticated));
        assert!(Ready.can_transition_to(RequiresReauth));
        assert!(RequiresReauth.can_transition_to(AwaitingAuth));
    }

    #[test]
    fn illegal_edges() {
        use SessionStatus::*;
        assert!(!Created.can_transition_to(Ready));
        assert!(!AwaitingAuth.can_transition_to(Ready));
        assert!(!RequiresReauth.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Removed.can_transition_to(Initializing));
        assert!(!Ready.can_transition_to(Created));
    }

    #[test]
    fn every_live_state_can_fail_and_restart() {
        for status in SessionStatus::ALL {
            if status.is_terminal() {
                continue;
            }
            assert!(status.can_transition_to(SessionStatus::Failed));
            assert!(status.can_transition_to(SessionStatus::Initializing));
        }
        assert!(SessionStatus::Failed.can_transition_to(SessionStatus::Initializing));
    }

    #[test]
    fn auth_data_invariant() {
        let mut meta = SessionMetadata::new("s".into(), "u".into(), CreateSessionOptions::qr());
        assert!(meta.invariants_hold());
        meta.auth_data = Some(Challenge::qr("x"));
        assert!(!meta.invariants_hold());
        meta.status = SessionStatus::AwaitingAuth;
        assert!(meta.invariants_hold());
    }
}
