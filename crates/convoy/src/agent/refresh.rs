//! In-place driver replacement.
//!
//! A refresh builds a second driver on the same data directory and only
//! swaps it in once it proves authenticated. Until then the current driver
//! keeps serving, and on failure it simply stays.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::agent::bounded;
use super::{AgentEvent, AutomationAgent};
use crate::driver::RemoteClientDriver;
use crate::retry::{RetryPolicy, WaitOutcome, wait_until};

/// Result of [`AutomationAgent::refresh_context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed { generation: u64 },
    /// The previous driver is still active.
    Failed { reason: String },
    /// Not authenticated, or shut down; nothing to preserve.
    Skipped,
    /// Another refresh is already running.
    InProgress,
}

impl AutomationAgent {
    /// Replace the driver without dropping authentication.
    pub async fn refresh_context(self: &Arc<Self>) -> RefreshOutcome {
        let Ok(_refreshing) = self.refresh_lock.try_lock() else {
            debug!("Session {}: refresh already running", self.session_id);
            return RefreshOutcome::InProgress;
        };
        if self.is_closed() || !self.is_authenticated() {
            debug!("Session {}: not authenticated, refresh skipped", self.session_id);
            return RefreshOutcome::Skipped;
        }

        info!(
            "Session {}: refreshing driver context (generation {})",
            self.session_id,
            self.generation()
        );
        match self.build_replacement().await {
            Ok(candidate) => self.install(candidate).await,
            Err(reason) => self.refresh_failed(reason),
        }
    }

    /// Create, start and verify a replacement driver.
    async fn build_replacement(&self) -> Result<Box<dyn RemoteClientDriver>, String> {
        let init_timeout = self.config.init_timeout;
        let call_timeout = self.config.call_timeout;

        let mut candidate = bounded("create", init_timeout, self.factory.create(&self.slot))
            .await
            .map_err(|err| format!("creating driver: {}", err))?;
        if let Err(err) = bounded("initialize", init_timeout, candidate.initialize(&self.slot)).await {
            self.discard(candidate).await;
            return Err(format!("initializing driver: {}", err));
        }

        let policy = RetryPolicy::new(self.config.refresh_poll_interval, self.config.refresh_budget);
        let candidate = Mutex::new(candidate);
        let outcome = {
            let candidate = &candidate;
            let session_id = self.session_id.as_str();
            wait_until(&policy, move |attempt| async move {
                let mut driver = candidate.lock().await;
                match bounded("check_authenticated", call_timeout, driver.check_authenticated()).await {
                    Ok(authenticated) => authenticated.then_some(()),
                    Err(err) => {
                        debug!(
                            "Session {}: replacement check {} failed: {}",
                            session_id, attempt, err
                        );
                        None
                    }
                }
            })
            .await
        };

        let candidate = candidate.into_inner();
        match outcome {
            WaitOutcome::Ready(()) => Ok(candidate),
            WaitOutcome::TimedOut { attempts, elapsed } => {
                self.discard(candidate).await;
                Err(format!(
                    "replacement not authenticated after {} checks in {:?}",
                    attempts, elapsed
                ))
            }
        }
    }

    /// Swap `candidate` in, re-arm the status handler, reset the session
    /// clock, then close the previous driver.
    async fn install(self: &Arc<Self>, candidate: Box<dyn RemoteClientDriver>) -> RefreshOutcome {
        let previous = {
            let mut driver = self.driver.lock().await;
            if self.is_closed() {
                drop(driver);
                self.discard(candidate).await;
                return RefreshOutcome::Skipped;
            }
            let previous = std::mem::replace(&mut *driver, candidate);
            self.disarm_status_handler();
            self.arm_status_handler(&mut **driver);
            previous
        };

        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.session_started_at = Instant::now();
            state.memory_usage_ratio = 0.0;
            state.refreshes_completed += 1;
            state.generation
        };
        self.reset_lost();
        self.discard(previous).await;

        info!(
            "Session {}: context refreshed, now generation {}",
            self.session_id, generation
        );
        self.emit(AgentEvent::RefreshCompleted { generation });
        RefreshOutcome::Completed { generation }
    }

    fn refresh_failed(&self, reason: String) -> RefreshOutcome {
        warn!(
            "Session {}: context refresh failed, keeping current driver: {}",
            self.session_id, reason
        );
        self.state().refreshes_failed += 1;
        self.emit(AgentEvent::RefreshFailed {
            reason: reason.clone(),
        });
        RefreshOutcome::Failed { reason }
    }
}
