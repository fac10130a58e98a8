//! Periodic memory sampling for authenticated agents.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{AgentEvent, AutomationAgent, PressureLevel, evaluate_pressure};

/// Sample memory every `memory_check_interval` until the agent is dropped or
/// shut down. Holds only a weak reference between ticks.
pub(super) fn spawn_memory_monitor(agent: &Arc<AutomationAgent>) -> JoinHandle<()> {
    let weak = Arc::downgrade(agent);
    let period = agent.config.memory_check_interval;
    let session_id = agent.session_id.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(agent) = weak.upgrade() else {
                break;
            };
            if agent.is_closed() {
                break;
            }
            agent.check_resources().await;
        }
        debug!("Session {}: memory monitor stopped", session_id);
    })
}

impl AutomationAgent {
    /// Take one memory sample and react to it: soft pressure frees caches in
    /// place, hard pressure (or an over-age session) refreshes the context.
    pub async fn check_resources(self: &Arc<Self>) -> PressureLevel {
        if self.is_closed() || !self.is_authenticated() {
            return PressureLevel::Normal;
        }

        let ratio = match self.memory_usage().await {
            Ok(ratio) => ratio,
            Err(err) => {
                debug!("Session {}: memory sample failed: {}", self.session_id, err);
                return PressureLevel::Normal;
            }
        };
        self.state().memory_usage_ratio = ratio;

        let level = evaluate_pressure(ratio, self.session_age(), &self.config);
        match level {
            PressureLevel::Normal => {}
            PressureLevel::Soft => {
                info!(
                    "Session {}: memory at {:.0}%, releasing cached resources",
                    self.session_id,
                    ratio * 100.0
                );
                self.emit(AgentEvent::ResourcePressure { level, ratio });
                match self.release_memory().await {
                    Ok(()) => {
                        self.state().cleanups += 1;
                        self.emit(AgentEvent::CleanupPerformed { ratio });
                    }
                    Err(err) => warn!("Session {}: cleanup failed: {}", self.session_id, err),
                }
            }
            PressureLevel::Hard => {
                warn!(
                    "Session {}: memory at {:.0}% after {:?}, refreshing context",
                    self.session_id,
                    ratio * 100.0,
                    self.session_age()
                );
                self.emit(AgentEvent::ResourcePressure { level, ratio });
                self.refresh_context().await;
            }
        }
        level
    }
}
