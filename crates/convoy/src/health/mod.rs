//! Periodic health checks over all live sessions.

mod monitor;

pub use monitor::{HealthMonitor, SweepReport};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Fast liveness probe of every driver.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Slower pass over connection states and slot health.
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// Upper bound for one probe, including the wait for a busy driver.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_check_interval: Duration,
    /// Sessions idle longer than this are removed. `"0s"` disables the sweep.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Connection states after which a session is reset. Compared
    /// case-insensitively.
    pub unrecoverable_states: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            idle_check_interval: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            unrecoverable_states: vec![
                "conflict".to_string(),
                "unpaired".to_string(),
                "unpaired_idle".to_string(),
                "deprecated_version".to_string(),
            ],
        }
    }
}

impl HealthConfig {
    /// The idle timeout, unless the sweep is disabled.
    pub fn idle_limit(&self) -> Option<Duration> {
        self.idle_timeout.filter(|limit| !limit.is_zero())
    }

    pub fn is_unrecoverable(&self, state: &str) -> bool {
        self.unrecoverable_states
            .iter()
            .any(|marker| marker.eq_ignore_ascii_case(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_markers_ignore_case() {
        let config = HealthConfig::default();
        assert!(config.is_unrecoverable("CONFLICT"));
        assert!(config.is_unrecoverable("unpaired"));
        assert!(!config.is_unrecoverable("CONNECTED"));
        assert!(!config.is_unrecoverable("opening"));
    }

    #[test]
    fn config_overrides_markers() {
        let config: HealthConfig = toml::from_str(
            r#"
            keepalive_interval = "2s"
            unrecoverable_states = ["banned"]
            "#,
        )
        .unwrap();
        assert_eq!(config.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(1800)));
        assert!(config.is_unrecoverable("BANNED"));
        assert!(!config.is_unrecoverable("conflict"));
    }

    #[test]
    fn zero_idle_timeout_disables_sweep() {
        let config: HealthConfig = toml::from_str(r#"idle_timeout = "0s""#).unwrap();
        assert_eq!(config.idle_limit(), None);
        assert_eq!(
            HealthConfig::default().idle_limit(),
            Some(Duration::from_secs(1800))
        );
    }
}
