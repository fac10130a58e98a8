use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::monitor::spawn_memory_monitor;
use super::{AgentConfig, AgentEvent};
use crate::driver::{
    AuthMethod, Challenge, DriverError, DriverEvent, DriverFactory, DriverResult, ProbeReport,
    PublishOp, RemoteClientDriver,
};
use crate::isolation::IsolationSlot;

const EVENT_CAPACITY: usize = 256;

/// Mutable bookkeeping shared between the agent's tasks.
pub(super) struct AgentState {
    pub(super) status_handler_ready: bool,
    pub(super) memory_usage_ratio: f64,
    pub(super) session_started_at: Instant,
    pub(super) generation: u64,
    pub(super) inflight: u32,
    pub(super) last_probe: Option<(DateTime<Utc>, bool)>,
    pub(super) refreshes_completed: u32,
    pub(super) refreshes_failed: u32,
    pub(super) cleanups: u32,
    pub(super) pump: Option<JoinHandle<()>>,
    pub(super) monitor: Option<JoinHandle<()>>,
}

impl AgentState {
    fn new() -> Self {
        Self {
            status_handler_ready: false,
            memory_usage_ratio: 0.0,
            session_started_at: Instant::now(),
            generation: 1,
            inflight: 0,
            last_probe: None,
            refreshes_completed: 0,
            refreshes_failed: 0,
            cleanups: 0,
            pump: None,
            monitor: None,
        }
    }
}

/// Point-in-time view of an agent for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub session_id: String,
    pub user_id: String,
    /// Incremented on every successful context refresh.
    pub generation: u64,
    pub authenticated: bool,
    pub status_handler_ready: bool,
    pub memory_usage_ratio: f64,
    pub session_age_secs: u64,
    pub inflight: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_probe_connected: Option<bool>,
    pub refreshes_completed: u32,
    pub refreshes_failed: u32,
    pub cleanups: u32,
}

/// Owner of one session's driver.
///
/// Every driver call goes through the `driver` mutex, so at most one
/// operation is in flight against the connection. Calls are bounded by
/// timeouts that include the wait for the lock.
pub struct AutomationAgent {
    pub(super) session_id: String,
    pub(super) slot: IsolationSlot,
    pub(super) config: AgentConfig,
    pub(super) factory: Arc<dyn DriverFactory>,
    pub(super) driver: Mutex<Box<dyn RemoteClientDriver>>,
    pub(super) refresh_lock: Mutex<()>,
    state: StdMutex<AgentState>,
    events: broadcast::Sender<AgentEvent>,
    challenge: watch::Sender<Option<Challenge>>,
    authenticated: AtomicBool,
    closed: AtomicBool,
    lost: AtomicBool,
}

pub(super) async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = DriverResult<T>>,
) -> DriverResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::timeout(operation, timeout)),
    }
}

impl AutomationAgent {
    /// Build an agent around a fresh driver for `slot`. The driver is not
    /// started until [`initialize`](Self::initialize).
    pub async fn new(
        session_id: impl Into<String>,
        slot: IsolationSlot,
        factory: Arc<dyn DriverFactory>,
        config: AgentConfig,
    ) -> DriverResult<Arc<Self>> {
        let driver = bounded("create", config.init_timeout, factory.create(&slot)).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (challenge, _) = watch::channel(None);

        Ok(Arc::new(Self {
            session_id: session_id.into(),
            slot,
            config,
            factory,
            driver: Mutex::new(driver),
            refresh_lock: Mutex::new(()),
            state: StdMutex::new(AgentState::new()),
            events,
            challenge,
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        }))
    }

    pub(super) fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.slot.user_id
    }

    pub fn slot(&self) -> &IsolationSlot {
        &self.slot
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub(super) fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_status_handler(&self) -> bool {
        self.state().status_handler_ready
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn memory_usage_ratio(&self) -> f64 {
        self.state().memory_usage_ratio
    }

    pub fn session_age(&self) -> Duration {
        self.state().session_started_at.elapsed()
    }

    pub fn inflight(&self) -> u32 {
        self.state().inflight
    }

    /// Count one more operation in flight. Returns the new count.
    pub fn begin_operation(&self) -> u32 {
        let mut state = self.state();
        state.inflight += 1;
        state.inflight
    }

    /// Count one operation as finished. Returns how many are still running.
    pub fn end_operation(&self) -> u32 {
        let mut state = self.state();
        state.inflight = state.inflight.saturating_sub(1);
        state.inflight
    }

    /// Most recent challenge seen from the driver.
    pub fn latest_challenge(&self) -> Option<Challenge> {
        self.challenge.borrow().clone()
    }

    pub fn watch_challenge(&self) -> watch::Receiver<Option<Challenge>> {
        self.challenge.subscribe()
    }

    pub fn clear_challenge(&self) {
        self.challenge.send_replace(None);
    }

    /// Report a fatal error once. Later calls pass results through untouched.
    pub(super) fn observe<T>(&self, result: DriverResult<T>) -> DriverResult<T> {
        if let Err(err) = &result
            && err.is_fatal()
            && !self.lost.swap(true, Ordering::SeqCst)
        {
            error!("Session {}: driver lost: {}", self.session_id, err);
            self.emit(AgentEvent::DriverLost {
                reason: err.to_string(),
            });
        }
        result
    }

    pub(super) fn reset_lost(&self) {
        self.lost.store(false, Ordering::SeqCst);
    }

    /// Take the driver's event stream and start consuming it. Returns false
    /// when a handler is already armed for the current driver.
    pub(super) fn arm_status_handler(self: &Arc<Self>, driver: &mut dyn RemoteClientDriver) -> bool {
        let mut state = self.state();
        if state.status_handler_ready {
            return false;
        }
        let Some(events) = driver.take_events() else {
            return false;
        };
        state.pump = Some(spawn_event_pump(Arc::downgrade(self), events));
        state.status_handler_ready = true;
        debug!(
            "Session {}: status handler armed (generation {})",
            self.session_id, state.generation
        );
        true
    }

    /// Abort the current handler so the next driver can be armed.
    pub(super) fn disarm_status_handler(&self) {
        let mut state = self.state();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.status_handler_ready = false;
    }

    fn handle_driver_event(&self, event: DriverEvent) {
        match &event {
            DriverEvent::Challenge(challenge) => {
                debug!(
                    "Session {}: {:?} challenge received",
                    self.session_id, challenge.kind
                );
                self.challenge.send_replace(Some(challenge.clone()));
            }
            DriverEvent::Authenticated | DriverEvent::Ready => {
                self.set_authenticated(true);
            }
            DriverEvent::LoggedOut => {
                info!("Session {}: logged out remotely", self.session_id);
                self.set_authenticated(false);
            }
            DriverEvent::Disconnected { reason } => {
                debug!("Session {}: driver disconnected: {}", self.session_id, reason);
            }
            DriverEvent::StateChanged { state } => {
                debug!("Session {}: connection state {}", self.session_id, state);
            }
        }
        self.emit(AgentEvent::Driver(event));
    }

    /// Start the driver and arm the status handler.
    pub async fn initialize(self: &Arc<Self>) -> DriverResult<()> {
        let result = bounded("initialize", self.config.init_timeout, async {
            let mut driver = self.driver.lock().await;
            self.arm_status_handler(&mut **driver);
            driver.initialize(&self.slot).await
        })
        .await;
        self.observe(result)?;
        info!(
            "Session {}: driver initialized for user {} at {}:{}",
            self.session_id, self.slot.user_id, self.slot.address, self.slot.port
        );
        Ok(())
    }

    pub async fn check_authenticated(&self) -> DriverResult<bool> {
        let result = bounded("check_authenticated", self.config.call_timeout, async {
            self.driver.lock().await.check_authenticated().await
        })
        .await;
        let authenticated = self.observe(result)?;
        if authenticated {
            self.set_authenticated(true);
        }
        Ok(authenticated)
    }

    /// Ask the driver for a challenge. A returned challenge also becomes the
    /// latest one.
    pub async fn issue_challenge(
        &self,
        method: AuthMethod,
        phone: Option<&str>,
    ) -> DriverResult<Option<Challenge>> {
        let result = bounded("issue_challenge", self.config.call_timeout, async {
            self.driver.lock().await.issue_challenge(method, phone).await
        })
        .await;
        let challenge = self.observe(result)?;
        if let Some(challenge) = &challenge {
            self.challenge.send_replace(Some(challenge.clone()));
        }
        Ok(challenge)
    }

    pub async fn wait_authenticated(&self, timeout: Duration) -> DriverResult<bool> {
        let budget = timeout + self.config.call_timeout;
        let result = bounded("wait_authenticated", budget, async {
            self.driver.lock().await.wait_authenticated(timeout).await
        })
        .await;
        let authenticated = self.observe(result)?;
        if authenticated {
            self.set_authenticated(true);
        }
        Ok(authenticated)
    }

    pub async fn wait_ready(&self, timeout: Duration) -> DriverResult<bool> {
        let budget = timeout + self.config.call_timeout;
        let result = bounded("wait_ready", budget, async {
            self.driver.lock().await.wait_ready(timeout).await
        })
        .await;
        self.observe(result)
    }

    pub async fn phone_number(&self) -> DriverResult<Option<String>> {
        let result = bounded("phone_number", self.config.call_timeout, async {
            self.driver.lock().await.phone_number().await
        })
        .await;
        self.observe(result)
    }

    /// Run one publish operation. Queues behind any other driver call; the
    /// wait counts against the operation's budget.
    pub async fn publish(&self, op: &PublishOp) -> DriverResult<Value> {
        let timeout = self
            .config
            .publish_timeout
            .unwrap_or_else(|| op.kind.default_timeout());
        let operation = format!("publish {}", op.kind);
        let result = bounded(&operation, timeout, async {
            self.driver.lock().await.publish(op, timeout).await
        })
        .await;
        if let Err(err) = &result {
            warn!("Session {}: {} failed: {}", self.session_id, operation, err);
        }
        self.observe(result)
    }

    /// Lightweight liveness probe. `Ok(None)` means the driver was busy for
    /// all of `lock_timeout` and was not probed.
    pub async fn probe(&self, lock_timeout: Duration) -> DriverResult<Option<ProbeReport>> {
        let Ok(mut driver) = tokio::time::timeout(lock_timeout, self.driver.lock()).await else {
            debug!("Session {}: driver busy, probe skipped", self.session_id);
            return Ok(None);
        };
        let result = bounded("probe", self.config.call_timeout, driver.probe()).await;
        drop(driver);

        let report = self.observe(result)?;
        self.state().last_probe = Some((Utc::now(), report.connected));
        Ok(Some(report))
    }

    /// Whether the driver still answers. A busy driver counts as alive.
    pub async fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.probe(self.config.call_timeout).await {
            Ok(Some(report)) => report.connected,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    pub async fn memory_usage(&self) -> DriverResult<f64> {
        let result = bounded("memory_usage", self.config.call_timeout, async {
            self.driver.lock().await.memory_usage().await
        })
        .await;
        let ratio = self.observe(result)?;
        if !ratio.is_finite() {
            return Err(DriverError::Protocol(format!(
                "memory usage is not a number: {}",
                ratio
            )));
        }
        Ok(ratio.clamp(0.0, 1.0))
    }

    pub async fn release_memory(&self) -> DriverResult<()> {
        let result = bounded("release_memory", self.config.call_timeout, async {
            self.driver.lock().await.release_memory().await
        })
        .await;
        self.observe(result)
    }

    /// Start the memory monitor. Idempotent while a monitor is running.
    pub fn start_monitor(self: &Arc<Self>) -> bool {
        let mut state = self.state();
        if state.monitor.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        state.monitor = Some(spawn_memory_monitor(self));
        true
    }

    /// Close a driver that is no longer referenced by the agent.
    pub(super) async fn discard(&self, mut driver: Box<dyn RemoteClientDriver>) {
        if let Err(err) = bounded("close", self.config.close_timeout, driver.close()).await {
            warn!("Session {}: closing driver failed: {}", self.session_id, err);
        }
    }

    /// Stop monitors and close the driver. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (pump, monitor) = {
            let mut state = self.state();
            state.status_handler_ready = false;
            (state.pump.take(), state.monitor.take())
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        match tokio::time::timeout(self.config.close_timeout, self.driver.lock()).await {
            Ok(mut driver) => {
                match bounded("close", self.config.close_timeout, driver.close()).await {
                    Ok(()) => info!("Session {}: driver closed", self.session_id),
                    Err(err) => warn!("Session {}: closing driver failed: {}", self.session_id, err),
                }
            }
            Err(_) => warn!(
                "Session {}: driver still busy after {:?}, leaving it to be dropped",
                self.session_id, self.config.close_timeout
            ),
        }

        if let Some(pump) = pump {
            pump.abort();
        }
        self.set_authenticated(false);
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let state = self.state();
        AgentSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.slot.user_id.clone(),
            generation: state.generation,
            authenticated: self.is_authenticated(),
            status_handler_ready: state.status_handler_ready,
            memory_usage_ratio: state.memory_usage_ratio,
            session_age_secs: state.session_started_at.elapsed().as_secs(),
            inflight: state.inflight,
            last_probe_at: state.last_probe.map(|(at, _)| at),
            last_probe_connected: state.last_probe.map(|(_, connected)| connected),
            refreshes_completed: state.refreshes_completed,
            refreshes_failed: state.refreshes_failed,
            cleanups: state.cleanups,
        }
    }
}

fn spawn_event_pump(
    agent: Weak<AutomationAgent>,
    mut events: mpsc::Receiver<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(agent) = agent.upgrade() else {
                break;
            };
            agent.handle_driver_event(event);
        }
    })
}
