//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy::agent::AgentConfig;
use convoy::auth::AuthConfig;
use convoy::container::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    ContainerState,
};
use convoy::driver::{
    AuthMethod, Challenge, DriverError, DriverEvent, DriverFactory, DriverResult, ProbeReport,
    PublishOp, RemoteClientDriver,
};
use convoy::isolation::{IsolationAllocator, IsolationConfig, IsolationMode, IsolationSlot};
use convoy::orchestrator::{OrchestratorConfig, OrchestratorSettings, SessionOrchestrator};
use convoy::registry::{SessionEvent, SessionMetadata, SessionRegistry, SessionStatus};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

/// In-memory stand-in for docker/podman.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Container>>,
    pub created: AtomicUsize,
    create_delay: Mutex<Duration>,
    inspect_broken: AtomicBool,
}

impl FakeRuntime {
    /// `create_container` takes this long before it returns.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    /// `inspect` fails as if the daemon were unreachable.
    pub fn break_inspect(&self, broken: bool) {
        self.inspect_broken.store(broken, Ordering::SeqCst);
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.state = state;
        }
    }

    pub fn state_of(&self, name: &str) -> Option<ContainerState> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|container| container.state)
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let name = config
            .name
            .clone()
            .ok_or_else(|| ContainerError::InvalidInput("name required".to_string()))?;
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let id = format!("id-{name}");
        let container = Container {
            id: id.clone(),
            names: vec![name.clone()],
            image: config.image.clone(),
            state: ContainerState::Running,
            labels: config.labels.clone(),
        };
        self.containers.lock().unwrap().insert(name, container);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        match self.containers.lock().unwrap().get_mut(container_id) {
            Some(container) => {
                container.state = ContainerState::Running;
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.set_state(container_id, ContainerState::Exited);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn list_containers(&self, _all: bool) -> ContainerResult<Vec<Container>> {
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        if self.inspect_broken.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: "Cannot connect to the container daemon".to_string(),
            });
        }
        Ok(self.state_of(id_or_name).map(|state| state.to_string()))
    }
}

/// Account-level state shared by every driver the factory builds. It plays
/// the part of the remote service plus the tenant's data directory.
struct Account {
    authenticated: bool,
    ready: bool,
    push_qr: bool,
    issue_qr: bool,
    pairing_code: Option<String>,
    phone: Option<String>,
    memory_ratio: f64,
    publish_delay: Duration,
    replacements_fail: bool,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            authenticated: false,
            ready: false,
            push_qr: true,
            issue_qr: true,
            pairing_code: None,
            phone: Some("15550001111".to_string()),
            memory_ratio: 0.1,
            publish_delay: Duration::ZERO,
            replacements_fail: false,
        }
    }
}

/// What the test can see of one driver instance.
pub struct DriverRecord {
    pub index: usize,
    pub user_id: String,
    /// Never reports authenticated, whatever the account says.
    pub unauthenticated: bool,
    closed: AtomicBool,
    fatal: AtomicBool,
    probe_state: Mutex<String>,
    events: Mutex<Option<mpsc::Sender<DriverEvent>>>,
    pub publishes: AtomicUsize,
    pub releases: AtomicUsize,
    pub auth_checks: AtomicUsize,
    /// Budget handed to the most recent publish.
    pub publish_budget: Mutex<Option<Duration>>,
    /// While set, `check_authenticated` does not answer.
    gate: Option<Arc<AtomicBool>>,
}

impl DriverRecord {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make every further call fail as if the process died.
    pub fn kill(&self) {
        self.fatal.store(true, Ordering::SeqCst);
    }

    pub fn set_probe_state(&self, state: &str) {
        *self.probe_state.lock().unwrap() = state.to_string();
    }

    fn send(&self, event: DriverEvent) {
        if self.is_closed() {
            return;
        }
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.try_send(event);
        }
    }
}

/// Scripted remote service behind a [`FakeFactory`].
#[derive(Default)]
pub struct FakeControl {
    account: Mutex<Account>,
    drivers: Mutex<Vec<Arc<DriverRecord>>>,
    check_gate: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeControl {
    fn account(&self) -> std::sync::MutexGuard<'_, Account> {
        self.account.lock().unwrap()
    }

    /// The tenant answered the challenge; the client syncs immediately.
    pub fn authenticate(&self) {
        {
            let mut account = self.account();
            account.authenticated = true;
            account.ready = true;
        }
        self.broadcast(DriverEvent::Authenticated);
        self.broadcast(DriverEvent::Ready);
    }

    /// Credentials exist before the first driver starts.
    pub fn persist_credentials(&self) {
        let mut account = self.account();
        account.authenticated = true;
        account.ready = true;
    }

    /// Accepted but never finishes syncing.
    pub fn authenticate_without_ready(&self) {
        self.account().authenticated = true;
        self.broadcast(DriverEvent::Authenticated);
    }

    pub fn log_out(&self) {
        {
            let mut account = self.account();
            account.authenticated = false;
            account.ready = false;
        }
        self.broadcast(DriverEvent::LoggedOut);
    }

    pub fn set_push_qr(&self, push: bool) {
        self.account().push_qr = push;
    }

    pub fn set_issue_qr(&self, issue: bool) {
        self.account().issue_qr = issue;
    }

    pub fn set_pairing_code(&self, code: Option<&str>) {
        self.account().pairing_code = code.map(str::to_string);
    }

    pub fn set_phone(&self, phone: Option<&str>) {
        self.account().phone = phone.map(str::to_string);
    }

    pub fn set_memory(&self, ratio: f64) {
        self.account().memory_ratio = ratio;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.account().publish_delay = delay;
    }

    /// Drivers created from now on never authenticate.
    pub fn fail_replacements(&self, fail: bool) {
        self.account().replacements_fail = fail;
    }

    /// Drivers created from now on stall in `check_authenticated` until
    /// [`open_auth_checks`](Self::open_auth_checks).
    pub fn hold_auth_checks(&self) {
        *self.check_gate.lock().unwrap() = Some(Arc::new(AtomicBool::new(true)));
    }

    pub fn open_auth_checks(&self) {
        if let Some(gate) = self.check_gate.lock().unwrap().take() {
            gate.store(false, Ordering::SeqCst);
        }
    }

    pub fn drivers(&self) -> Vec<Arc<DriverRecord>> {
        self.drivers.lock().unwrap().clone()
    }

    pub fn drivers_for(&self, user_id: &str) -> Vec<Arc<DriverRecord>> {
        self.drivers()
            .into_iter()
            .filter(|driver| driver.user_id == user_id)
            .collect()
    }

    pub fn driver(&self, index: usize) -> Arc<DriverRecord> {
        self.drivers()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.drivers.lock().unwrap().len()
    }

    fn broadcast(&self, event: DriverEvent) {
        for driver in self.drivers() {
            driver.send(event.clone());
        }
    }
}

pub struct FakeFactory {
    control: Arc<FakeControl>,
}

impl FakeFactory {
    pub fn new(control: Arc<FakeControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn create(&self, slot: &IsolationSlot) -> DriverResult<Box<dyn RemoteClientDriver>> {
        let (tx, rx) = mpsc::channel(64);
        let mut drivers = self.control.drivers.lock().unwrap();
        let record = Arc::new(DriverRecord {
            index: drivers.len(),
            user_id: slot.user_id.clone(),
            unauthenticated: self.control.account().replacements_fail,
            closed: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            probe_state: Mutex::new("CONNECTED".to_string()),
            events: Mutex::new(Some(tx)),
            publishes: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            auth_checks: AtomicUsize::new(0),
            publish_budget: Mutex::new(None),
            gate: self.control.check_gate.lock().unwrap().clone(),
        });
        drivers.push(record.clone());
        Ok(Box::new(FakeDriver {
            control: self.control.clone(),
            record,
            events: Some(rx),
        }))
    }
}

pub struct FakeDriver {
    control: Arc<FakeControl>,
    record: Arc<DriverRecord>,
    events: Option<mpsc::Receiver<DriverEvent>>,
}

impl FakeDriver {
    fn check(&self) -> DriverResult<()> {
        if self.record.is_closed() {
            return Err(DriverError::Closed);
        }
        if self.record.fatal.load(Ordering::SeqCst) {
            return Err(DriverError::Fatal("driver process exited".to_string()));
        }
        Ok(())
    }

    fn authenticated(&self) -> bool {
        account_authenticated(&self.control, &self.record)
    }
}

fn account_authenticated(control: &FakeControl, record: &DriverRecord) -> bool {
    !record.unauthenticated && control.account().authenticated
}

fn account_ready(control: &FakeControl, record: &DriverRecord) -> bool {
    !record.unauthenticated && control.account().ready
}

async fn poll_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[async_trait]
impl RemoteClientDriver for FakeDriver {
    async fn initialize(&mut self, _slot: &IsolationSlot) -> DriverResult<()> {
        self.check()?;
        let push_qr = {
            let account = self.control.account();
            account.push_qr && !account.authenticated
        };
        if push_qr {
            self.record.send(DriverEvent::Challenge(Challenge::qr(format!(
                "qr-{}",
                self.record.index
            ))));
        }
        Ok(())
    }

    async fn check_authenticated(&mut self) -> DriverResult<bool> {
        self.record.auth_checks.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.record.gate {
            while gate.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        self.check()?;
        Ok(self.authenticated())
    }

    async fn issue_challenge(
        &mut self,
        method: AuthMethod,
        _phone: Option<&str>,
    ) -> DriverResult<Option<Challenge>> {
        self.check()?;
        let account = self.control.account();
        Ok(match method {
            AuthMethod::Qr if account.issue_qr => Some(Challenge::qr(format!(
                "qr-issued-{}",
                self.record.index
            ))),
            AuthMethod::Qr => None,
            AuthMethod::PairingCode => account.pairing_code.clone().map(Challenge::pairing_code),
        })
    }

    async fn wait_authenticated(&mut self, timeout: Duration) -> DriverResult<bool> {
        self.check()?;
        let (control, record) = (self.control.clone(), self.record.clone());
        Ok(poll_for(timeout, move || account_authenticated(&control, &record)).await)
    }

    async fn wait_ready(&mut self, timeout: Duration) -> DriverResult<bool> {
        self.check()?;
        let (control, record) = (self.control.clone(), self.record.clone());
        Ok(poll_for(timeout, move || account_ready(&control, &record)).await)
    }

    async fn phone_number(&mut self) -> DriverResult<Option<String>> {
        self.check()?;
        Ok(self.control.account().phone.clone())
    }

    async fn publish(&mut self, op: &PublishOp, timeout: Duration) -> DriverResult<Value> {
        self.check()?;
        *self.record.publish_budget.lock().unwrap() = Some(timeout);
        let delay = self.control.account().publish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.record.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "driver": self.record.index,
            "kind": op.kind.to_string(),
        }))
    }

    async fn probe(&mut self) -> DriverResult<ProbeReport> {
        self.check()?;
        Ok(ProbeReport {
            connected: self.authenticated(),
            state: self.record.probe_state.lock().unwrap().clone(),
        })
    }

    async fn memory_usage(&mut self) -> DriverResult<f64> {
        self.check()?;
        Ok(self.control.account().memory_ratio)
    }

    async fn release_memory(&mut self) -> DriverResult<()> {
        self.check()?;
        self.record.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<DriverEvent>> {
        self.events.take()
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.record.closed.store(true, Ordering::SeqCst);
        self.record.events.lock().unwrap().take();
        Ok(())
    }
}

/// Millisecond-scale budgets so scenarios finish quickly.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        orchestrator: OrchestratorConfig {
            max_sessions_per_user: 1,
            challenge_max_age: Duration::from_secs(60),
        },
        auth: AuthConfig {
            qr_event_window: Duration::from_millis(50),
            scrape_fallback_window: Duration::from_millis(50),
            pairing_window: Duration::from_millis(100),
            auth_budget: Duration::from_secs(3),
            ready_budget: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        },
        agent: AgentConfig {
            memory_check_interval: Duration::from_millis(20),
            refresh_budget: Duration::from_millis(100),
            refresh_poll_interval: Duration::from_millis(10),
            init_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_millis(500),
            close_timeout: Duration::from_millis(500),
            ..AgentConfig::default()
        },
    }
}

pub fn local_isolation() -> IsolationConfig {
    IsolationConfig {
        mode: IsolationMode::Local,
        block_start: 0,
        block_end: 0,
        host_start: 2,
        host_end: 9,
        ..IsolationConfig::default()
    }
}

pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub control: Arc<FakeControl>,
    pub dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(fast_settings())
}

pub fn harness_with(settings: OrchestratorSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(FakeControl::default());
    let orchestrator = orchestrator_on(
        &dir,
        control.clone(),
        Arc::new(SessionRegistry::new()),
        settings,
    );
    Harness {
        orchestrator,
        control,
        dir,
    }
}

/// An orchestrator in local isolation mode rooted at `dir`.
pub fn orchestrator_on(
    dir: &TempDir,
    control: Arc<FakeControl>,
    registry: Arc<SessionRegistry>,
    settings: OrchestratorSettings,
) -> SessionOrchestrator {
    let allocator = Arc::new(IsolationAllocator::new(local_isolation(), dir.path(), None).unwrap());
    SessionOrchestrator::new(
        registry,
        allocator,
        Arc::new(FakeFactory::new(control)),
        settings,
    )
}

/// Poll until `condition` holds for the session's metadata, or give up.
pub async fn wait_for_session(
    orchestrator: &SessionOrchestrator,
    session_id: &str,
    within: Duration,
    condition: impl Fn(Option<&SessionMetadata>) -> bool,
) -> Option<SessionMetadata> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = orchestrator.get_status(session_id).ok();
        if condition(current.as_ref()) {
            return current;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "session {} did not reach the expected state within {:?}, last seen: {:?}",
                session_id, within, current
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(
    orchestrator: &SessionOrchestrator,
    session_id: &str,
    status: SessionStatus,
) -> SessionMetadata {
    wait_for_session(orchestrator, session_id, Duration::from_secs(5), |session| {
        session.is_some_and(|s| s.status == status)
    })
    .await
    .unwrap()
}

pub async fn wait_for_removal(orchestrator: &SessionOrchestrator, session_id: &str) {
    wait_for_session(orchestrator, session_id, Duration::from_secs(5), |session| {
        session.is_none()
    })
    .await;
}

/// Next event matching `filter`, or panic after `within`.
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    within: Duration,
    filter: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if filter(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Drain everything already queued on `events`.
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
