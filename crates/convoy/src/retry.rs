//! Timeout-bounded waiting.
//!
//! Every wait site in the orchestrator (challenge capture, authentication
//! confirmation, ready confirmation, refresh verification) goes through
//! [`wait_until`] with a [`RetryPolicy`], so no wait can outlive its budget.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Interval, attempt cap and total budget for a polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Optional cap on the number of attempts.
    pub max_attempts: Option<u32>,
    /// Total wall-clock budget, including time spent inside attempts.
    pub budget: Duration,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            budget,
        }
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The probe produced a value.
    Ready(T),
    /// The budget or attempt cap ran out first.
    TimedOut { attempts: u32, elapsed: Duration },
}

impl<T> WaitOutcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            WaitOutcome::Ready(value) => Some(value),
            WaitOutcome::TimedOut { .. } => None,
        }
    }
}

/// Run `probe` until it yields `Some`, the attempt cap is hit, or the budget
/// elapses. Each attempt is itself cut off at the remaining budget.
pub async fn wait_until<T, F, Fut>(policy: &RetryPolicy, mut probe: F) -> WaitOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let deadline = start + policy.budget;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());

        if let Ok(Some(value)) = tokio::time::timeout(remaining, probe(attempts)).await {
            return WaitOutcome::Ready(value);
        }

        let exhausted = policy.max_attempts.is_some_and(|max| attempts >= max);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if exhausted || remaining.is_zero() {
            return WaitOutcome::TimedOut {
                attempts,
                elapsed: start.elapsed(),
            };
        }

        tokio::time::sleep(policy.interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_ready_value() {
        let policy = RetryPolicy::new(Duration::from_millis(5), Duration::from_secs(1));
        let outcome = wait_until(&policy, |attempt| async move {
            (attempt == 3).then_some(attempt)
        })
        .await;
        assert_eq!(outcome, WaitOutcome::Ready(3));
    }

    #[tokio::test]
    async fn stops_at_attempt_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(5))
            .with_max_attempts(4);
        let counter = calls.clone();
        let outcome: WaitOutcome<()> = wait_until(&policy, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }
        })
        .await;

        assert!(matches!(outcome, WaitOutcome::TimedOut { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn slow_attempt_is_cut_at_budget() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50));
        let started = std::time::Instant::now();
        let outcome: WaitOutcome<()> = wait_until(&policy, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Some(())
        })
        .await;

        assert!(matches!(outcome, WaitOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
