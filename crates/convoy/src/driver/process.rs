//! Driver backed by an external process speaking JSON lines on stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::isolation::IsolationSlot;

use super::wire::{WireChallenge, WireMessage, WireRequest};
use super::{
    AuthMethod, Challenge, DriverConfig, DriverError, DriverEvent, DriverFactory, DriverResult,
    ProbeReport, PublishOp, RemoteClientDriver,
};

type PendingCalls = HashMap<String, oneshot::Sender<DriverResult<Value>>>;
type PendingMap = Arc<Mutex<PendingCalls>>;

/// Never held across an await.
fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops a call's pending entry however its wait ends, including when the
/// caller gives up and drops the future.
struct PendingEntry {
    pending: PendingMap,
    id: String,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

const EXITED: &str = "driver process exited";

/// Spawns one [`ProcessDriver`] per session.
#[derive(Debug, Clone)]
pub struct ProcessDriverFactory {
    config: DriverConfig,
}

impl ProcessDriverFactory {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverFactory for ProcessDriverFactory {
    async fn create(&self, slot: &IsolationSlot) -> DriverResult<Box<dyn RemoteClientDriver>> {
        Ok(Box::new(ProcessDriver::new(
            self.config.clone(),
            slot.user_id.clone(),
        )))
    }
}

/// Client for one driver subprocess.
///
/// The process is spawned by `initialize`. A writer task feeds stdin, a reader
/// task routes responses to pending callers and events to the event channel.
pub struct ProcessDriver {
    config: DriverConfig,
    user_id: String,
    child: Option<Child>,
    command_tx: Option<mpsc::Sender<String>>,
    pending: PendingMap,
    request_counter: u64,
    event_tx: mpsc::Sender<DriverEvent>,
    event_rx: Option<mpsc::Receiver<DriverEvent>>,
    exited: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ProcessDriver {
    pub fn new(config: DriverConfig, user_id: String) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            config,
            user_id,
            child: None,
            command_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_counter: 0,
            event_tx,
            event_rx: Some(event_rx),
            exited: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    fn spawn(&mut self, slot: &IsolationSlot) -> DriverResult<()> {
        let mut child = Command::new(&self.config.binary)
            .args(&self.config.args)
            .arg("--user-id")
            .arg(&slot.user_id)
            .arg("--data-dir")
            .arg(&slot.data_dir)
            .arg("--state-dir")
            .arg(&slot.state_dir)
            .arg("--address")
            .arg(slot.address.to_string())
            .arg("--port")
            .arg(slot.port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Protocol("driver process has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Protocol("driver process has no stdout".to_string()))?;

        let (command_tx, command_rx) = mpsc::channel::<String>(16);

        self.handles.push(tokio::spawn(stdin_writer_task(
            stdin,
            command_rx,
            self.user_id.clone(),
        )));
        self.handles.push(tokio::spawn(stdout_reader_task(
            stdout,
            self.event_tx.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.exited),
            self.user_id.clone(),
        )));
        if let Some(stderr) = child.stderr.take() {
            self.handles
                .push(tokio::spawn(stderr_reader_task(stderr, self.user_id.clone())));
        }

        info!(
            "Spawned driver {} for user {} (pid {:?})",
            self.config.binary,
            self.user_id,
            child.id()
        );
        self.child = Some(child);
        self.command_tx = Some(command_tx);
        Ok(())
    }

    fn next_request_id(&mut self) -> String {
        self.request_counter += 1;
        format!("req-{}", self.request_counter)
    }

    /// Send one request and wait for its response.
    async fn call(&mut self, method: &str, params: Value, timeout: Duration) -> DriverResult<Value> {
        let command_tx = self.command_tx.clone().ok_or(DriverError::Closed)?;
        if self.exited.load(Ordering::SeqCst) {
            return Err(DriverError::Fatal(EXITED.to_string()));
        }

        let id = self.next_request_id();
        let line = serde_json::to_string(&WireRequest {
            id: &id,
            method,
            params,
        })
        .map_err(|e| DriverError::Protocol(e.to_string()))?;

        let (response_tx, response_rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), response_tx);
        let _entry = PendingEntry {
            pending: Arc::clone(&self.pending),
            id,
        };

        // The reader drains pending calls on exit; one inserted after that
        // would otherwise wait out its full timeout.
        if self.exited.load(Ordering::SeqCst) || command_tx.send(line).await.is_err() {
            return Err(DriverError::Fatal(EXITED.to_string()));
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result.map_err(|e| match e {
                DriverError::Rejected { message, .. } => DriverError::Rejected {
                    operation: method.to_string(),
                    message,
                },
                other => other,
            }),
            Ok(Err(_)) => Err(DriverError::Fatal(EXITED.to_string())),
            Err(_) => Err(DriverError::timeout(method, timeout)),
        }
    }

    async fn call_default(&mut self, method: &str, params: Value) -> DriverResult<Value> {
        let timeout = self.config.request_timeout;
        self.call(method, params, timeout).await
    }

    async fn call_bool(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> DriverResult<bool> {
        let result = self.call(method, params, timeout).await?;
        result.as_bool().ok_or_else(|| {
            DriverError::Protocol(format!("{} returned {}, expected bool", method, result))
        })
    }

    /// Budget for calls that block on the remote side for `wait`.
    fn wait_budget(&self, wait: Duration) -> Duration {
        wait + self.config.request_timeout
    }
}

#[async_trait]
impl RemoteClientDriver for ProcessDriver {
    async fn initialize(&mut self, slot: &IsolationSlot) -> DriverResult<()> {
        if self.child.is_none() {
            self.spawn(slot)?;
        }
        let params = serde_json::to_value(slot).map_err(|e| DriverError::Protocol(e.to_string()))?;
        self.call_default("initialize", params).await?;
        Ok(())
    }

    async fn check_authenticated(&mut self) -> DriverResult<bool> {
        let timeout = self.config.request_timeout;
        self.call_bool("check_authenticated", Value::Null, timeout).await
    }

    async fn issue_challenge(
        &mut self,
        method: AuthMethod,
        phone: Option<&str>,
    ) -> DriverResult<Option<Challenge>> {
        let result = self
            .call_default("issue_challenge", json!({ "method": method, "phone": phone }))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let wire: WireChallenge =
            serde_json::from_value(result).map_err(|e| DriverError::Protocol(e.to_string()))?;
        Ok(Some(Challenge::new(wire.kind, wire.value)))
    }

    async fn wait_authenticated(&mut self, timeout: Duration) -> DriverResult<bool> {
        let budget = self.wait_budget(timeout);
        let params = json!({ "timeout_ms": timeout.as_millis() as u64 });
        self.call_bool("wait_authenticated", params, budget).await
    }

    async fn wait_ready(&mut self, timeout: Duration) -> DriverResult<bool> {
        let budget = self.wait_budget(timeout);
        let params = json!({ "timeout_ms": timeout.as_millis() as u64 });
        self.call_bool("wait_ready", params, budget).await
    }

    async fn phone_number(&mut self) -> DriverResult<Option<String>> {
        let result = self.call_default("phone_number", Value::Null).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn publish(&mut self, op: &PublishOp, timeout: Duration) -> DriverResult<Value> {
        let params = serde_json::to_value(op).map_err(|e| DriverError::Protocol(e.to_string()))?;
        self.call("publish", params, timeout).await
    }

    async fn probe(&mut self) -> DriverResult<ProbeReport> {
        let result = self.call_default("probe", Value::Null).await?;
        serde_json::from_value(result).map_err(|e| DriverError::Protocol(e.to_string()))
    }

    async fn memory_usage(&mut self) -> DriverResult<f64> {
        let result = self.call_default("memory_usage", Value::Null).await?;
        result
            .get("ratio")
            .and_then(Value::as_f64)
            .or_else(|| result.as_f64())
            .ok_or_else(|| DriverError::Protocol(format!("memory_usage returned {}", result)))
    }

    async fn release_memory(&mut self) -> DriverResult<()> {
        self.call_default("release_memory", Value::Null).await?;
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<DriverEvent>> {
        self.event_rx.take()
    }

    async fn close(&mut self) -> DriverResult<()> {
        if self.command_tx.is_none() {
            return Ok(());
        }

        if !self.exited.load(Ordering::SeqCst) {
            let timeout = self.config.exit_timeout;
            if let Err(e) = self.call("close", Value::Null, timeout).await {
                debug!("Driver for user {} did not ack close: {}", self.user_id, e);
            }
        }

        // Dropping the sender closes stdin.
        self.command_tx = None;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(self.config.exit_timeout, child.wait()).await {
                Ok(Ok(status)) => debug!("Driver for user {} exited: {}", self.user_id, status),
                Ok(Err(e)) => warn!("Failed to wait for driver of user {}: {}", self.user_id, e),
                Err(_) => {
                    warn!("Driver for user {} did not exit, killing", self.user_id);
                    child.kill().await?;
                }
            }
        }

        for handle in self.handles.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

async fn stdin_writer_task(
    mut stdin: ChildStdin,
    mut command_rx: mpsc::Receiver<String>,
    user_id: String,
) {
    while let Some(command) = command_rx.recv().await {
        let display: String = command.chars().take(200).collect();
        debug!("-> driver[{}]: {}", user_id, display);
        let line = format!("{}\n", command);
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!("Failed to write to driver[{}] stdin: {}", user_id, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!("Failed to flush driver[{}] stdin: {}", user_id, e);
            break;
        }
    }
    debug!("driver[{}] stdin writer ended", user_id);
}

async fn stdout_reader_task(
    stdout: ChildStdout,
    event_tx: mpsc::Sender<DriverEvent>,
    pending: PendingMap,
    exited: Arc<AtomicBool>,
    user_id: String,
) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let display: String = line.chars().take(200).collect();
        debug!("<- driver[{}]: {}", user_id, display);

        match WireMessage::parse(&line) {
            Ok(WireMessage::Response(response)) => {
                let Some(tx) = lock_pending(&pending).remove(&response.id) else {
                    debug!("driver[{}] late response for {}", user_id, response.id);
                    continue;
                };
                let result = if response.ok {
                    Ok(response.result)
                } else {
                    Err(DriverError::Rejected {
                        operation: String::new(),
                        message: response.error.unwrap_or_else(|| "unknown error".to_string()),
                    })
                };
                let _ = tx.send(result);
            }
            Ok(WireMessage::Event(event)) => {
                if event_tx.try_send(event.into()).is_err() {
                    warn!("driver[{}] event dropped, consumer is behind", user_id);
                }
            }
            Err(e) => warn!("driver[{}] sent unparseable line ({}): {}", user_id, e, display),
        }
    }

    exited.store(true, Ordering::SeqCst);
    let stranded = std::mem::take(&mut *lock_pending(&pending));
    for (_, tx) in stranded {
        let _ = tx.send(Err(DriverError::Fatal(EXITED.to_string())));
    }
    let _ = event_tx.try_send(DriverEvent::Disconnected {
        reason: EXITED.to_string(),
    });
    info!("driver[{}] stdout closed", user_id);
}

async fn stderr_reader_task(stderr: ChildStderr, user_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!("driver[{}] stderr: {}", user_id, line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::driver::PublishKind;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn slot(dir: &std::path::Path) -> IsolationSlot {
        IsolationSlot {
            user_id: "u1".to_string(),
            address: Ipv4Addr::new(10, 89, 0, 2),
            port: 40000,
            data_dir: dir.join("data"),
            state_dir: dir.join("state"),
            container_name: None,
            bound_sessions: Default::default(),
            allocated_at: Utc::now(),
        }
    }

    /// A shell stand-in for a driver: acks every request, then exits on close.
    fn script_driver(script: &str) -> ProcessDriver {
        let config = DriverConfig {
            binary: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "driver".to_string()],
            request_timeout: Duration::from_secs(2),
            exit_timeout: Duration::from_secs(2),
            event_buffer: 8,
        };
        ProcessDriver::new(config, "u1".to_string())
    }

    const ECHO_OK: &str = r#"
echo '{"event":"qr","value":"2@abc"}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"check_authenticated"'*) echo "{\"id\":\"$id\",\"ok\":true,\"result\":false}" ;;
    *'"method":"probe"'*) echo "{\"id\":\"$id\",\"ok\":true,\"result\":{\"connected\":true,\"state\":\"CONNECTED\"}}" ;;
    *'"method":"publish"'*) echo "{\"id\":\"$id\",\"ok\":false,\"error\":\"chat not found\"}" ;;
    *'"method":"close"'*) echo "{\"id\":\"$id\",\"ok\":true,\"result\":null}"; exit 0 ;;
    *) echo "{\"id\":\"$id\",\"ok\":true,\"result\":null}" ;;
  esac
done
"#;

    #[tokio::test]
    async fn round_trips_requests_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = script_driver(ECHO_OK);
        let mut events = driver.take_events().unwrap();
        assert!(driver.take_events().is_none());

        driver.initialize(&slot(dir.path())).await.unwrap();
        assert!(!driver.check_authenticated().await.unwrap());

        let report = driver.probe().await.unwrap();
        assert!(report.connected);
        assert_eq!(report.state, "CONNECTED");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, DriverEvent::Challenge(ref c) if c.value == "2@abc"));

        let op = PublishOp::new(PublishKind::Text, json!({"to": "x", "text": "hi"}));
        let err = driver
            .publish(&op, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Rejected { ref operation, .. } if operation == "publish"));

        driver.close().await.unwrap();
        assert!(matches!(driver.probe().await, Err(DriverError::Closed)));
    }

    /// Answers everything except `publish`, which it never acknowledges.
    const SILENT_PUBLISH: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"method":"publish"'*) ;;
    *'"method":"close"'*) echo "{\"id\":\"$id\",\"ok\":true,\"result\":null}"; exit 0 ;;
    *) echo "{\"id\":\"$id\",\"ok\":true,\"result\":null}" ;;
  esac
done
"#;

    #[tokio::test]
    async fn publish_uses_the_callers_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = script_driver(SILENT_PUBLISH);
        driver.initialize(&slot(dir.path())).await.unwrap();

        let op = PublishOp::new(PublishKind::Text, json!({"to": "x", "text": "hi"}));
        let started = std::time::Instant::now();
        let err = driver
            .publish(&op, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout { ref operation, .. } if operation == "publish"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(lock_pending(&driver.pending).is_empty());

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_call_leaves_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = script_driver(SILENT_PUBLISH);
        driver.initialize(&slot(dir.path())).await.unwrap();

        let op = PublishOp::new(PublishKind::Media, json!({"to": "x"}));
        let outer = tokio::time::timeout(
            Duration::from_millis(50),
            driver.publish(&op, Duration::from_secs(10)),
        )
        .await;
        assert!(outer.is_err());
        assert!(lock_pending(&driver.pending).is_empty());

        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = script_driver("read -r line; exit 3");
        let mut events = driver.take_events().unwrap();

        let err = driver.initialize(&slot(dir.path())).await.unwrap_err();
        assert!(err.is_fatal(), "got {:?}", err);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, DriverEvent::Disconnected { .. }));
        assert!(driver.probe().await.unwrap_err().is_fatal());
    }
}
