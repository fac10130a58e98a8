use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::HealthConfig;
use crate::driver::ProbeReport;
use crate::orchestrator::SessionOrchestrator;
use crate::registry::SessionEvent;

/// What one sweep saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub probed: usize,
    pub connected: Vec<String>,
    /// Reachable but not connected. Tolerated.
    pub disconnected: Vec<String>,
    /// Driver was busy with another operation for the whole probe window.
    pub busy: Vec<String>,
    /// Probe failed or timed out without a fatal error. Tolerated.
    pub unanswered: Vec<String>,
    /// Fatal driver errors; these sessions were removed.
    pub removed: Vec<String>,
    /// Sessions reset because of an unrecoverable connection state.
    pub reset: Vec<String>,
    /// Tenants whose slot failed its liveness probe.
    pub unhealthy_slots: Vec<String>,
}

enum ProbeResult {
    Report(ProbeReport),
    Busy,
    Unanswered,
    Fatal,
}

/// Runs keep-alive, reconciliation and idle sweeps against an orchestrator.
///
/// Probes for different sessions run concurrently, so one slow driver never
/// delays the others.
pub struct HealthMonitor {
    orchestrator: SessionOrchestrator,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(orchestrator: SessionOrchestrator, config: HealthConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe every session once. A fatal driver error removes the session
    /// immediately; anything else is only recorded.
    async fn probe_all(&self) -> Vec<(String, ProbeResult)> {
        let probes = self
            .orchestrator
            .agents()
            .into_iter()
            .map(|(session_id, agent)| async move {
                let window = self.config.probe_timeout;
                let bound = window + agent.config().call_timeout;
                let result = match tokio::time::timeout(bound, agent.probe(window)).await {
                    Ok(Ok(Some(report))) => ProbeResult::Report(report),
                    Ok(Ok(None)) => ProbeResult::Busy,
                    Ok(Err(err)) if err.is_fatal() => {
                        self.orchestrator
                            .handle_fatal(&session_id, &err.to_string())
                            .await;
                        ProbeResult::Fatal
                    }
                    Ok(Err(err)) => {
                        warn!("Session {}: probe failed: {}", session_id, err);
                        ProbeResult::Unanswered
                    }
                    Err(_) => {
                        warn!("Session {}: probe timed out after {:?}", session_id, bound);
                        ProbeResult::Unanswered
                    }
                };
                (session_id, result)
            });
        join_all(probes).await
    }

    /// Fast liveness pass over every driver.
    pub async fn keepalive_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for (session_id, result) in self.probe_all().await {
            report.probed += 1;
            match result {
                ProbeResult::Report(probe) if probe.connected => report.connected.push(session_id),
                ProbeResult::Report(probe) => {
                    debug!(
                        "Session {}: not connected ({}), tolerated",
                        session_id, probe.state
                    );
                    report.disconnected.push(session_id);
                }
                ProbeResult::Busy => report.busy.push(session_id),
                ProbeResult::Unanswered => report.unanswered.push(session_id),
                ProbeResult::Fatal => report.removed.push(session_id),
            }
        }
        if !report.removed.is_empty() {
            info!("Keep-alive sweep removed {} session(s)", report.removed.len());
        }
        report
    }

    /// Reset sessions stuck in an unrecoverable connection state and check
    /// the slots behind live sessions.
    pub async fn reconcile_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut reset = Vec::new();

        for (session_id, result) in self.probe_all().await {
            report.probed += 1;
            match result {
                ProbeResult::Report(probe) => {
                    if self.config.is_unrecoverable(&probe.state) {
                        warn!(
                            "Session {}: unrecoverable connection state {}, resetting",
                            session_id, probe.state
                        );
                        reset.push(session_id);
                    } else if probe.connected {
                        report.connected.push(session_id);
                    } else {
                        report.disconnected.push(session_id);
                    }
                }
                ProbeResult::Busy => report.busy.push(session_id),
                ProbeResult::Unanswered => report.unanswered.push(session_id),
                ProbeResult::Fatal => report.removed.push(session_id),
            }
        }

        let resets = join_all(
            reset
                .iter()
                .map(|session_id| self.orchestrator.recover_session(session_id)),
        )
        .await;
        for (session_id, outcome) in reset.into_iter().zip(resets) {
            match outcome {
                Ok(_) => report.reset.push(session_id),
                Err(err) => {
                    warn!("Session {}: reset failed: {}", session_id, err);
                    report.removed.push(session_id);
                }
            }
        }

        report.unhealthy_slots = self.check_slots().await;
        report
    }

    /// Probe the slot of every tenant with a live session. An unhealthy slot
    /// is reported and restarted, never released.
    async fn check_slots(&self) -> Vec<String> {
        let users: BTreeSet<String> = self
            .orchestrator
            .list_sessions()
            .into_iter()
            .map(|session| session.user_id)
            .collect();
        let allocator = self.orchestrator.allocator();

        let checks = users.into_iter().map(|user_id| async move {
            let healthy = allocator.is_healthy(&user_id).await;
            (user_id, healthy)
        });

        let mut unhealthy = Vec::new();
        for (user_id, healthy) in join_all(checks).await {
            if healthy {
                continue;
            }
            warn!("Slot of user {} failed its liveness probe", user_id);
            self.orchestrator
                .registry()
                .emit(SessionEvent::SlotUnhealthy {
                    user_id: user_id.clone(),
                });
            if let Err(err) = allocator.ensure_running(&user_id).await {
                warn!("Could not restart slot of user {}: {}", user_id, err);
            }
            unhealthy.push(user_id);
        }
        unhealthy
    }

    /// Remove idle sessions, if an idle timeout is configured.
    pub async fn idle_sweep(&self) -> Vec<String> {
        match self.config.idle_limit() {
            Some(max_idle) => self.orchestrator.sweep_idle(max_idle).await,
            None => Vec::new(),
        }
    }

    /// Start the keep-alive sweep in the background.
    pub fn start_keepalive_task(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting keep-alive sweep (every {:?})",
            self.config.keepalive_interval
        );
        let period = self.config.keepalive_interval;
        spawn_periodic(period, move || {
            let monitor = self.clone();
            async move {
                monitor.keepalive_sweep().await;
            }
        })
    }

    /// Start the reconciliation sweep in the background.
    pub fn start_reconcile_task(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting reconciliation sweep (every {:?})",
            self.config.reconcile_interval
        );
        let period = self.config.reconcile_interval;
        spawn_periodic(period, move || {
            let monitor = self.clone();
            async move {
                let report = monitor.reconcile_sweep().await;
                if !report.reset.is_empty() || !report.unhealthy_slots.is_empty() {
                    info!(
                        "Reconciliation reset {} session(s), {} unhealthy slot(s)",
                        report.reset.len(),
                        report.unhealthy_slots.len()
                    );
                }
            }
        })
    }

    /// Start the idle sweep in the background. Returns `None` when no idle
    /// timeout is configured.
    pub fn start_idle_task(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let max_idle = self.config.idle_limit()?;
        info!(
            "Starting idle session cleanup (check every {:?}, timeout {:?})",
            self.config.idle_check_interval, max_idle
        );
        let period = self.config.idle_check_interval;
        Some(spawn_periodic(period, move || {
            let monitor = self.clone();
            async move {
                monitor.idle_sweep().await;
            }
        }))
    }

    /// Start all sweeps. Abort the returned handles to stop them.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.clone().start_keepalive_task(),
            self.clone().start_reconcile_task(),
        ];
        handles.extend(self.start_idle_task());
        handles
    }
}

/// Run `tick` every `period`, skipping the immediate first tick. A slow tick
/// delays the next one instead of piling up.
fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            tick().await;
        }
    })
}
