//! Orchestrator façade.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use super::error::{OrchestratorError, OrchestratorResult};
use super::OrchestratorSettings;
use crate::agent::{AgentEvent, AgentSnapshot, AutomationAgent, RefreshOutcome};
use crate::auth::{AuthError, AuthStart, AuthStateMachine};
use crate::driver::{Challenge, DriverEvent, DriverFactory, PublishOp};
use crate::isolation::{IsolationAllocator, IsolationSlot, ReconcileReport, validate_user_id};
use crate::registry::{
    CreateSessionOptions, RemovalReason, SessionEvent, SessionMetadata, SessionRegistry,
    SessionRepository, SessionStatus,
};

/// Background tasks attached to one session.
#[derive(Default)]
struct SessionTasks {
    /// Consumes the agent's events.
    watcher: Option<JoinHandle<()>>,
    /// Confirmation or re-authentication in progress.
    auth: Option<JoinHandle<()>>,
}

/// Abort `handle` unless it is the task we are running on.
fn abort_unless_current(handle: JoinHandle<()>) {
    if tokio::task::try_id() != Some(handle.id()) {
        handle.abort();
    }
}

/// One publish in flight. The session is `active` while any are running;
/// the count and the status change together under the session's registry
/// key, so the last publish to finish is the one that returns it to `ready`.
struct InFlight<'a> {
    registry: &'a SessionRegistry,
    agent: &'a AutomationAgent,
    session_id: &'a str,
}

impl<'a> InFlight<'a> {
    /// `None` when the session is not in an operational state.
    fn begin(
        registry: &'a SessionRegistry,
        agent: &'a AutomationAgent,
        session_id: &'a str,
    ) -> OrchestratorResult<Option<Self>> {
        let started = registry.set_status_with(session_id, |current| {
            current.is_operational().then(|| {
                agent.begin_operation();
                SessionStatus::Active
            })
        })?;
        Ok(started.map(|_| Self {
            registry,
            agent,
            session_id,
        }))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let agent = self.agent;
        let mut counted = false;
        let result = self.registry.set_status_with(self.session_id, |current| {
            counted = true;
            let remaining = agent.end_operation();
            (remaining == 0 && current == SessionStatus::Active).then_some(SessionStatus::Ready)
        });
        if !counted {
            agent.end_operation();
        }
        if let Err(err) = result {
            warn!(
                "Session {}: could not leave active after publish: {}",
                self.session_id, err
            );
        }
    }
}

/// Outcome of start-up recovery.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub slots: ReconcileReport,
    /// Persisted sessions brought back with a new agent.
    pub recovered: Vec<String>,
    /// Persisted sessions whose recovery failed; they were removed.
    pub failed: Vec<String>,
    /// Persisted sessions that had already failed and were dropped.
    pub discarded: Vec<String>,
}

/// Outcome of [`SessionOrchestrator::remove_tenant`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantRemoval {
    pub user_id: String,
    pub sessions: Vec<String>,
    pub slot_released: bool,
    pub data_purged: bool,
}

/// Create, recover and remove sessions.
///
/// Cheap to clone; clones share all state. Operations on different sessions
/// never wait on each other. Creation, recovery and tenant removal for the
/// same tenant are serialized.
#[derive(Clone)]
pub struct SessionOrchestrator {
    registry: Arc<SessionRegistry>,
    allocator: Arc<IsolationAllocator>,
    factory: Arc<dyn DriverFactory>,
    repository: Option<SessionRepository>,
    agents: Arc<DashMap<String, Arc<AutomationAgent>>>,
    tasks: Arc<DashMap<String, SessionTasks>>,
    tenant_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    settings: Arc<OrchestratorSettings>,
}

impl SessionOrchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        allocator: Arc<IsolationAllocator>,
        factory: Arc<dyn DriverFactory>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            allocator,
            factory,
            repository: None,
            agents: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            tenant_locks: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
        }
    }

    /// Use `repository` for start-up recovery. The registry should write
    /// through to the same store.
    pub fn with_repository(mut self, repository: SessionRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn allocator(&self) -> &Arc<IsolationAllocator> {
        &self.allocator
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }

    fn tenant_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.tenant_locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    fn agent(&self, session_id: &str) -> OrchestratorResult<Arc<AutomationAgent>> {
        self.agents
            .get(session_id)
            .map(|agent| agent.value().clone())
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    fn is_current(&self, session_id: &str, agent: &Arc<AutomationAgent>) -> bool {
        self.agents
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), agent))
    }

    fn auth_machine(&self, session: &SessionMetadata, agent: Arc<AutomationAgent>) -> AuthStateMachine {
        AuthStateMachine::new(
            session,
            agent,
            self.registry.clone(),
            self.settings.auth.clone(),
        )
    }

    fn set_watcher_task(&self, session_id: &str, handle: JoinHandle<()>) {
        if !self.registry.contains(session_id) {
            abort_unless_current(handle);
            return;
        }
        let previous = self
            .tasks
            .entry(session_id.to_string())
            .or_default()
            .watcher
            .replace(handle);
        if let Some(previous) = previous {
            abort_unless_current(previous);
        }
    }

    fn set_auth_task(&self, session_id: &str, handle: JoinHandle<()>) {
        if !self.registry.contains(session_id) {
            abort_unless_current(handle);
            return;
        }
        let previous = self
            .tasks
            .entry(session_id.to_string())
            .or_default()
            .auth
            .replace(handle);
        if let Some(previous) = previous {
            abort_unless_current(previous);
        }
    }

    fn abort_tasks(&self, session_id: &str) {
        if let Some((_, tasks)) = self.tasks.remove(session_id) {
            for handle in [tasks.watcher, tasks.auth].into_iter().flatten() {
                abort_unless_current(handle);
            }
        }
    }

    /// Create a session for `user_id` and run it up to its challenge.
    ///
    /// Returns once the session is `awaiting_auth` (with or without a
    /// challenge) or `authenticated` from persisted credentials; confirmation
    /// continues in the background.
    pub async fn create_session(
        &self,
        user_id: &str,
        options: CreateSessionOptions,
    ) -> OrchestratorResult<SessionMetadata> {
        validate_user_id(user_id)?;
        let tenant = self.tenant_lock(user_id);
        let _tenant = tenant.lock().await;

        self.make_room(user_id).await?;
        let slot = self.allocator.allocate(user_id).await?;
        let session = self.registry.create(user_id, options);
        let session_id = session.session_id.clone();

        let launched = match self.allocator.bind(user_id, &session_id).await {
            Ok(()) => self.launch(&session, slot).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = launched {
            error!("Session {}: start failed: {}", session_id, err);
            self.fail_and_remove(&session_id, &err.to_string(), RemovalReason::DriverUnresponsive)
                .await;
            return Err(err);
        }

        self.get_status(&session_id)
    }

    /// Evict the least recently active sessions of `user_id` until a new one
    /// fits under the per-tenant cap. `active` sessions are never evicted.
    async fn make_room(&self, user_id: &str) -> OrchestratorResult<()> {
        let limit = self.settings.orchestrator.max_sessions_per_user.max(1);
        let existing = self.registry.list_by_user(user_id);
        if existing.len() < limit {
            return Ok(());
        }

        let excess = existing.len() + 1 - limit;
        let mut evictable: Vec<_> = existing
            .into_iter()
            .filter(|session| session.status != SessionStatus::Active)
            .collect();
        if evictable.len() < excess {
            return Err(OrchestratorError::SessionLimitReached {
                user_id: user_id.to_string(),
                limit,
            });
        }

        evictable.sort_by_key(|session| session.last_activity_at);
        for session in evictable.into_iter().take(excess) {
            info!(
                "Evicting session {} of user {} to stay within {} session(s)",
                session.session_id, user_id, limit
            );
            self.teardown(&session.session_id, RemovalReason::Evicted)
                .await;
        }
        Ok(())
    }

    /// Build an agent on `slot` and start authentication.
    async fn launch(
        &self,
        session: &SessionMetadata,
        slot: IsolationSlot,
    ) -> OrchestratorResult<AuthStart> {
        let session_id = session.session_id.as_str();
        let agent = AutomationAgent::new(
            session_id,
            slot,
            self.factory.clone(),
            self.settings.agent.clone(),
        )
        .await?;
        self.agents.insert(session_id.to_string(), agent.clone());
        self.set_watcher_task(session_id, self.spawn_watcher(session_id, &agent));

        let start = self
            .auth_machine(session, agent.clone())
            .start()
            .await
            .map_err(|err| OrchestratorError::from_auth(session_id, err))?;
        match &start {
            AuthStart::AlreadyAuthenticated => {
                info!("Session {}: authenticated from persisted state", session_id)
            }
            AuthStart::AwaitingAuth(Some(challenge)) => info!(
                "Session {}: awaiting authentication ({:?})",
                session_id, challenge.kind
            ),
            AuthStart::AwaitingAuth(None) => {
                warn!("Session {}: awaiting authentication without a challenge", session_id)
            }
        }

        self.set_auth_task(session_id, self.spawn_confirmation(session_id, agent));
        Ok(start)
    }

    fn spawn_confirmation(&self, session_id: &str, agent: Arc<AutomationAgent>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move { orchestrator.run_confirmation(&session_id, agent).await })
    }

    fn spawn_reauthentication(
        &self,
        session_id: &str,
        agent: Arc<AutomationAgent>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let Some(session) = orchestrator.registry.get(&session_id) else {
                return;
            };
            let restarted = orchestrator
                .auth_machine(&session, agent.clone())
                .restart()
                .await;
            match restarted {
                Ok(_) => orchestrator.run_confirmation(&session_id, agent).await,
                Err(err) => orchestrator.handle_auth_failure(&session_id, err).await,
            }
        })
    }

    async fn run_confirmation(&self, session_id: &str, agent: Arc<AutomationAgent>) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        match self.auth_machine(&session, agent).confirm().await {
            Ok(phone) => info!(
                "Session {}: ready{}",
                session_id,
                if phone.is_some() { "" } else { " (no phone number reported)" }
            ),
            Err(err) => self.handle_auth_failure(session_id, err).await,
        }
    }

    /// Authentication timeouts are terminal: the session is failed and
    /// removed, its driver closed, its slot kept.
    async fn handle_auth_failure(&self, session_id: &str, err: AuthError) {
        match err {
            AuthError::Timeout { phase, budget } => {
                error!(
                    "Session {}: {} not confirmed within {:?}, tearing down",
                    session_id, phase, budget
                );
                let message = format!("{} not confirmed within {:?}", phase, budget);
                self.fail_and_remove(session_id, &message, RemovalReason::AuthenticationTimeout)
                    .await;
            }
            AuthError::Driver(err) if err.is_fatal() => {
                self.handle_fatal(session_id, &err.to_string()).await;
            }
            other => warn!("Session {}: authentication interrupted: {}", session_id, other),
        }
    }

    fn spawn_watcher(&self, session_id: &str, agent: &Arc<AutomationAgent>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let session_id = session_id.to_string();
        let mut events = agent.subscribe();
        let agent = Arc::downgrade(agent);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => orchestrator.on_agent_event(&session_id, &agent, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session {}: missed {} agent event(s)", session_id, skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_agent_event(
        &self,
        session_id: &str,
        agent: &Weak<AutomationAgent>,
        event: AgentEvent,
    ) {
        let Some(agent) = agent.upgrade() else {
            return;
        };
        if !self.is_current(session_id, &agent) {
            return;
        }

        match event {
            AgentEvent::Driver(DriverEvent::LoggedOut) => self.on_logged_out(session_id, agent),
            AgentEvent::DriverLost { reason } => {
                self.handle_fatal(session_id, &reason).await;
            }
            AgentEvent::RefreshCompleted { generation } => {
                self.registry.emit(SessionEvent::RefreshCompleted {
                    session_id: session_id.to_string(),
                    generation,
                });
            }
            AgentEvent::RefreshFailed { reason } => {
                self.registry.emit(SessionEvent::RefreshFailed {
                    session_id: session_id.to_string(),
                    reason,
                });
            }
            _ => {}
        }
    }

    /// A remote logout moves an authenticated session to `requires_reauth`
    /// and restarts the challenge cycle on the same agent and slot.
    fn on_logged_out(&self, session_id: &str, agent: Arc<AutomationAgent>) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        if !matches!(
            session.status,
            SessionStatus::Authenticated | SessionStatus::Ready | SessionStatus::Active
        ) {
            debug!(
                "Session {}: logout while {}, ignored",
                session_id, session.status
            );
            return;
        }
        if let Err(err) = self
            .registry
            .set_status(session_id, SessionStatus::RequiresReauth)
        {
            warn!("Session {}: cannot require re-authentication: {}", session_id, err);
            return;
        }
        info!("Session {}: logged out, restarting authentication", session_id);
        self.set_auth_task(session_id, self.spawn_reauthentication(session_id, agent));
    }

    pub fn get_status(&self, session_id: &str) -> OrchestratorResult<SessionMetadata> {
        self.registry
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    /// Current challenge for a session waiting on authentication. A missing
    /// or stale challenge is fetched again; a miss is
    /// [`OrchestratorError::ChallengeTimeout`].
    pub async fn get_challenge(&self, session_id: &str) -> OrchestratorResult<Challenge> {
        let session = self.get_status(session_id)?;
        if !session.status.accepts_auth_data() {
            return Err(OrchestratorError::NotAwaitingAuth {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        if let Some(challenge) = &session.auth_data
            && !challenge.is_stale(self.settings.orchestrator.challenge_max_age)
        {
            return Ok(challenge.clone());
        }

        let agent = self.agent(session_id)?;
        debug!("Session {}: fetching a fresh challenge", session_id);
        self.auth_machine(&session, agent)
            .fetch_challenge()
            .await
            .map_err(|err| OrchestratorError::from_auth(session_id, err))?
            .ok_or_else(|| OrchestratorError::ChallengeTimeout {
                session_id: session_id.to_string(),
            })
    }

    /// Run one publish operation on a `ready` or `active` session.
    pub async fn publish(&self, session_id: &str, op: PublishOp) -> OrchestratorResult<Value> {
        let session = self.get_status(session_id)?;
        if !session.status.is_operational() {
            return Err(OrchestratorError::NotReady {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        let agent = self.agent(session_id)?;

        let Some(operation) = InFlight::begin(&self.registry, &agent, session_id)? else {
            return Err(OrchestratorError::NotReady {
                session_id: session_id.to_string(),
                status: self.get_status(session_id)?.status,
            });
        };
        let result = agent.publish(&op).await;
        drop(operation);

        match result {
            Ok(value) => {
                self.registry.touch(session_id);
                Ok(value)
            }
            Err(err) if err.is_fatal() => {
                self.handle_fatal(session_id, &err.to_string()).await;
                Err(OrchestratorError::DriverUnresponsive {
                    session_id: session_id.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tear a session down on request. The tenant's slot and data stay.
    pub async fn remove_session(&self, session_id: &str) -> OrchestratorResult<SessionMetadata> {
        self.teardown(session_id, RemovalReason::Requested)
            .await
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    /// Restart a session's lifecycle on its tenant's slot with a new agent.
    /// The driver is expected to restore authentication from the data
    /// directory; otherwise a new challenge is issued.
    pub async fn recover_session(&self, session_id: &str) -> OrchestratorResult<SessionMetadata> {
        let session = self.get_status(session_id)?;
        let user_id = session.user_id.clone();
        let tenant = self.tenant_lock(&user_id);
        let _tenant = tenant.lock().await;

        info!("Session {}: recovering on the slot of user {}", session_id, user_id);
        self.abort_tasks(session_id);
        if let Some((_, agent)) = self.agents.remove(session_id) {
            agent.shutdown().await;
        }

        let launched: OrchestratorResult<AuthStart> = async {
            self.allocator.allocate(&user_id).await?;
            let slot = self.allocator.ensure_running(&user_id).await?;
            self.allocator.bind(&user_id, session_id).await?;
            self.launch(&session, slot).await
        }
        .await;

        if let Err(err) = launched {
            error!("Session {}: recovery failed: {}", session_id, err);
            self.fail_and_remove(session_id, &err.to_string(), RemovalReason::DriverUnresponsive)
                .await;
            return Err(err);
        }
        self.get_status(session_id)
    }

    /// Replace a session's driver now instead of waiting for memory pressure.
    pub async fn refresh_session(&self, session_id: &str) -> OrchestratorResult<u64> {
        let agent = self.agent(session_id)?;
        match agent.refresh_context().await {
            RefreshOutcome::Completed { generation } => Ok(generation),
            RefreshOutcome::Failed { reason } => Err(OrchestratorError::RefreshFailed {
                session_id: session_id.to_string(),
                reason,
            }),
            RefreshOutcome::InProgress => Err(OrchestratorError::RefreshFailed {
                session_id: session_id.to_string(),
                reason: "a refresh is already running".to_string(),
            }),
            RefreshOutcome::Skipped => Err(OrchestratorError::NotReady {
                session_id: session_id.to_string(),
                status: self.get_status(session_id)?.status,
            }),
        }
    }

    /// The driver behind a session is gone. Drop the session everywhere; the
    /// slot stays allocated and its data directory is kept so the tenant can
    /// authenticate again later. Returns false if the session was already
    /// gone.
    pub async fn handle_fatal(&self, session_id: &str, reason: &str) -> bool {
        if !self.registry.contains(session_id) && !self.agents.contains_key(session_id) {
            return false;
        }
        error!(
            "Session {}: driver lost ({}), removing session and keeping tenant data",
            session_id, reason
        );
        self.fail_and_remove(session_id, reason, RemovalReason::DriverUnresponsive)
            .await;
        true
    }

    /// Remove every session of a tenant, release its slot and optionally
    /// delete its data. The only path that gives an address back.
    pub async fn remove_tenant(
        &self,
        user_id: &str,
        purge_data: bool,
    ) -> OrchestratorResult<TenantRemoval> {
        let tenant = self.tenant_lock(user_id);
        let _tenant = tenant.lock().await;

        let mut removal = TenantRemoval {
            user_id: user_id.to_string(),
            ..Default::default()
        };
        for session in self.registry.list_by_user(user_id) {
            if self
                .teardown(&session.session_id, RemovalReason::TenantRemoved)
                .await
                .is_some()
            {
                removal.sessions.push(session.session_id);
            }
        }

        removal.slot_released = self.allocator.release(user_id).await?.is_some();
        if purge_data {
            removal.data_purged = self.allocator.purge_data(user_id).await?;
        }
        info!(
            "Removed tenant {}: {} session(s), slot released: {}, data purged: {}",
            user_id,
            removal.sessions.len(),
            removal.slot_released,
            removal.data_purged
        );
        Ok(removal)
    }

    /// Remove sessions idle for longer than `max_idle`. `active` sessions
    /// are never swept.
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        self.registry
            .sweep_idle(max_idle, |session| {
                let orchestrator = self.clone();
                async move {
                    orchestrator
                        .teardown(&session.session_id, RemovalReason::Idle)
                        .await;
                }
            })
            .await
    }

    /// Mark a session failed, then tear it down.
    async fn fail_and_remove(&self, session_id: &str, message: &str, reason: RemovalReason) {
        if self
            .registry
            .set_status(session_id, SessionStatus::Failed)
            .is_ok()
        {
            let _ = self.registry.set_error(session_id, message);
        }
        self.teardown(session_id, reason).await;
    }

    /// Stop the session's tasks, close its driver, drop it from the registry
    /// and unbind it from its slot. The slot itself is kept.
    async fn teardown(&self, session_id: &str, reason: RemovalReason) -> Option<SessionMetadata> {
        self.abort_tasks(session_id);
        if let Some((_, agent)) = self.agents.remove(session_id) {
            agent.shutdown().await;
        }

        let removed = self.registry.remove(session_id, reason)?;
        self.allocator.unbind(&removed.user_id, session_id).await;
        Some(removed)
    }

    /// Start-up recovery: adopt live slots, then bring back every persisted
    /// session that had not failed.
    pub async fn restore(&self) -> OrchestratorResult<RestoreReport> {
        let mut report = RestoreReport {
            slots: self.allocator.reconcile().await?,
            ..Default::default()
        };
        let Some(repository) = &self.repository else {
            return Ok(report);
        };

        let mut pending = Vec::new();
        for session in repository.list().await? {
            let session_id = session.session_id.clone();
            if session.status.is_terminal() {
                repository.delete(&session_id).await?;
                report.discarded.push(session_id);
                continue;
            }
            if self.registry.contains(&session_id) {
                continue;
            }
            self.registry.restore(session);
            pending.push(session_id);
        }

        let outcomes = join_all(pending.iter().map(|id| self.recover_session(id))).await;
        for (session_id, outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.recovered.push(session_id),
                Err(err) => {
                    warn!("Could not restore session {}: {}", session_id, err);
                    report.failed.push(session_id);
                }
            }
        }

        info!(
            "Restored {} session(s) ({} failed, {} discarded)",
            report.recovered.len(),
            report.failed.len(),
            report.discarded.len()
        );
        Ok(report)
    }

    /// Close every agent and stop background work. Sessions, slots and the
    /// persisted registry are left in place for the next start.
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for session_id in &session_ids {
            self.abort_tasks(session_id);
        }

        let agents: Vec<Arc<AutomationAgent>> =
            self.agents.iter().map(|e| e.value().clone()).collect();
        self.agents.clear();
        join_all(agents.iter().map(|agent| agent.shutdown())).await;
        self.registry.flush().await;
        info!("Orchestrator stopped, {} agent(s) closed", agents.len());
    }

    /// Sessions ordered by creation time.
    pub fn list_sessions(&self) -> Vec<SessionMetadata> {
        let mut sessions = self.registry.list();
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }

    /// Live agents keyed by session id.
    pub fn agents(&self) -> Vec<(String, Arc<AutomationAgent>)> {
        self.agents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn agent_snapshot(&self, session_id: &str) -> Option<AgentSnapshot> {
        self.agents.get(session_id).map(|agent| agent.snapshot())
    }

    pub fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<_> = self.agents.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }
}
