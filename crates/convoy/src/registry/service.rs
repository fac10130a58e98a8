//! In-memory authoritative session registry.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::driver::Challenge;

use super::error::{RegistryError, RegistryResult};
use super::models::{
    CreateSessionOptions, RemovalReason, SessionEvent, SessionMetadata, SessionStatus,
};
use super::repository::SessionRepository;

const EVENT_CAPACITY: usize = 1024;

enum PersistOp {
    Upsert(Box<SessionMetadata>),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// Concurrent map of session metadata.
///
/// Every mutation happens under the map's per-key lock and is atomic for that
/// session; different sessions never contend. When a repository is attached,
/// snapshots are queued for a single writer task while the key is still
/// locked, so the store sees each session's changes in order.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionMetadata>,
    events: broadcast::Sender<SessionEvent>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Memory-only registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: DashMap::new(),
            events,
            persist_tx: None,
        }
    }

    /// Registry that writes through to `repository`. Must be called inside a
    /// Tokio runtime; the writer task lives as long as the registry.
    pub fn with_store(repository: SessionRepository) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_worker(repository, rx));
        Self {
            persist_tx: Some(tx),
            ..Self::new()
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persist_tx.is_some()
    }

    fn persist(&self, session: &SessionMetadata) {
        if let Some(ref tx) = self.persist_tx {
            let _ = tx.send(PersistOp::Upsert(Box::new(session.clone())));
        }
    }

    /// Wait until every queued write has reached the store.
    pub async fn flush(&self) {
        if let Some(ref tx) = self.persist_tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(PersistOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Register a new session in `created` state.
    pub fn create(&self, user_id: &str, options: CreateSessionOptions) -> SessionMetadata {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = SessionMetadata::new(session_id.clone(), user_id.to_string(), options);

        self.sessions.insert(session_id.clone(), session.clone());
        self.persist(&session);
        info!("Created session {} for user {}", session_id, user_id);
        self.emit(SessionEvent::Created {
            session_id,
            user_id: user_id.to_string(),
        });
        session
    }

    /// Re-insert a session loaded from the store.
    pub fn restore(&self, mut session: SessionMetadata) {
        session.auth_data = None;
        debug!(
            "Restored session {} ({}) for user {}",
            session.session_id, session.status, session.user_id
        );
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMetadata> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Apply `f` to the session under its key lock, persisting the result.
    fn update<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionMetadata) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        let out = f(entry.value_mut())?;
        self.persist(entry.value());
        Ok(out)
    }

    /// Move a session to `status`, returning the previous status.
    ///
    /// Leaving an auth-accepting state drops the challenge; entering
    /// `requires_reauth` or `initializing` drops the captured phone number.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> RegistryResult<SessionStatus> {
        self.set_status_with(session_id, |_| Some(status))
            .map(|previous| previous.unwrap_or(status))
    }

    /// Like [`set_status`](Self::set_status), but the target is chosen by
    /// `decide` from the current status while the session's key is locked.
    /// `None` leaves the session untouched and is returned as `Ok(None)`.
    pub fn set_status_with(
        &self,
        session_id: &str,
        decide: impl FnOnce(SessionStatus) -> Option<SessionStatus>,
    ) -> RegistryResult<Option<SessionStatus>> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        let session = entry.value_mut();
        let from = session.status;
        let Some(status) = decide(from) else {
            return Ok(None);
        };
        if !from.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                session_id: session_id.to_string(),
                from,
                to: status,
            });
        }

        session.status = status;
        if !status.accepts_auth_data() {
            session.auth_data = None;
        }
        if matches!(
            status,
            SessionStatus::RequiresReauth | SessionStatus::Initializing
        ) {
            session.phone_number = None;
        }
        if !matches!(status, SessionStatus::Failed) {
            session.error_message = None;
        }
        self.persist(entry.value());
        drop(entry);

        if from != status {
            info!("Session {}: {} -> {}", session_id, from, status);
            self.emit(SessionEvent::StatusChanged {
                session_id: session_id.to_string(),
                from,
                to: status,
            });
        }
        Ok(Some(from))
    }

    /// Attach or clear the challenge. A challenge can only be attached while
    /// the session is waiting for authentication.
    pub fn set_auth_data(&self, session_id: &str, data: Option<Challenge>) -> RegistryResult<()> {
        let kind = data.as_ref().map(|c| c.kind);
        self.update(session_id, |session| {
            if data.is_some() && !session.status.accepts_auth_data() {
                return Err(RegistryError::AuthDataNotAllowed {
                    session_id: session_id.to_string(),
                    status: session.status,
                });
            }
            session.auth_data = data;
            Ok(())
        })?;

        if let Some(kind) = kind {
            debug!("Session {}: challenge issued ({:?})", session_id, kind);
            self.emit(SessionEvent::ChallengeIssued {
                session_id: session_id.to_string(),
                kind,
            });
        }
        Ok(())
    }

    /// Record the authenticated identity. Returns `true` only the first time
    /// it is set in the current authenticated lifetime.
    pub fn set_phone_number(&self, session_id: &str, phone: &str) -> RegistryResult<bool> {
        let newly_set = self.update(session_id, |session| {
            if !session.status.is_operational() {
                return Err(RegistryError::InvalidTransition {
                    session_id: session_id.to_string(),
                    from: session.status,
                    to: SessionStatus::Ready,
                });
            }
            if session.phone_number.is_some() {
                return Ok(false);
            }
            session.phone_number = Some(phone.to_string());
            Ok(true)
        })?;

        if newly_set {
            info!("Session {}: captured phone number", session_id);
            self.emit(SessionEvent::PhoneNumberCaptured {
                session_id: session_id.to_string(),
                phone_number: phone.to_string(),
            });
        }
        Ok(newly_set)
    }

    pub fn set_error(&self, session_id: &str, message: impl Into<String>) -> RegistryResult<()> {
        let message = message.into();
        self.update(session_id, |session| {
            session.error_message = Some(message);
            Ok(())
        })
    }

    /// Bump `last_activity_at`. Returns `false` for unknown sessions.
    pub fn touch(&self, session_id: &str) -> bool {
        self.update(session_id, |session| {
            session.last_activity_at = Utc::now();
            Ok(())
        })
        .is_ok()
    }

    /// Drop a session. Callers are responsible for releasing its agent first.
    pub fn remove(&self, session_id: &str, reason: RemovalReason) -> Option<SessionMetadata> {
        let (_, mut session) = self.sessions.remove(session_id)?;
        if let Some(ref tx) = self.persist_tx {
            let _ = tx.send(PersistOp::Delete(session_id.to_string()));
        }

        let previous = session.status;
        session.status = SessionStatus::Removed;
        session.auth_data = None;
        info!(
            "Removed session {} for user {} (was {}, reason {})",
            session_id, session.user_id, previous, reason
        );
        self.emit(SessionEvent::StatusChanged {
            session_id: session_id.to_string(),
            from: previous,
            to: SessionStatus::Removed,
        });
        self.emit(SessionEvent::Removed {
            session_id: session_id.to_string(),
            reason,
        });
        Some(session)
    }

    /// Snapshot of all sessions. Safe against concurrent insert/remove.
    pub fn list(&self) -> Vec<SessionMetadata> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<SessionMetadata> {
        self.sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Sessions idle longer than `max_idle` that are not `active`.
    pub fn idle_candidates(&self, max_idle: Duration) -> Vec<SessionMetadata> {
        let now = Utc::now();
        self.sessions
            .iter()
            .filter(|s| s.status != SessionStatus::Active && s.idle_for(now) > max_idle)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Tear down every idle, non-active session through `teardown`.
    ///
    /// Each candidate is re-checked right before its teardown runs, so a
    /// session that became active or was touched mid-sweep survives. The
    /// registry never deletes metadata itself here; `teardown` must release
    /// the agent and slot binding and remove the entry.
    pub async fn sweep_idle<F, Fut>(&self, max_idle: Duration, teardown: F) -> Vec<String>
    where
        F: Fn(SessionMetadata) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut swept = Vec::new();
        for candidate in self.idle_candidates(max_idle) {
            let Some(current) = self.get(&candidate.session_id) else {
                continue;
            };
            if current.status == SessionStatus::Active || current.idle_for(Utc::now()) <= max_idle
            {
                continue;
            }
            debug!(
                "Session {} idle for {:?}, sweeping",
                current.session_id,
                current.idle_for(Utc::now())
            );
            swept.push(current.session_id.clone());
            teardown(current).await;
        }
        if !swept.is_empty() {
            info!("Idle sweep removed {} session(s)", swept.len());
        }
        swept
    }
}

async fn persist_worker(repository: SessionRepository, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Upsert(session) => {
                if let Err(e) = repository.upsert(&session).await {
                    warn!("Failed to persist session {}: {:#}", session.session_id, e);
                }
            }
            PersistOp::Delete(session_id) => {
                if let Err(e) = repository.delete(&session_id).await {
                    warn!("Failed to delete persisted session {}: {:#}", session_id, e);
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Session persistence worker stopped");
}
