//! Retry policy with exponential backoff for controller errors
//!
//! Errors are classified as transient or permanent. Transient errors are
//! requeued with exponential backoff, never sooner than the error rate
//! limiter's remaining window for the same Service.

use std::collections::HashMap;
use std::time::Duration;

use kube::runtime::controller::Action;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::rules::ServiceKey;

/// Maximum number of retries before giving up
const MAX_RETRIES: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (1 hour)
const MAX_DELAY_SECS: u64 = 3600;

/// Consecutive failed passes per Service
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<ServiceKey, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the retry count for a Service and return the new count
    pub fn increment(&self, key: &ServiceKey) -> u32 {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Call on successful reconciliation
    pub fn reset(&self, key: &ServiceKey) {
        self.attempts.lock().remove(key);
    }

    pub fn get(&self, key: &ServiceKey) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Router unavailable, rollback, store conflicts: retried with backoff
    Transient,
    /// Invalid annotation, port conflict: wait for the Service to change
    Permanent,
}

/// Delay before the next attempt, or `None` to wait for a change
pub fn backoff_delay(attempt: u32, kind: ErrorKind) -> Option<Duration> {
    match kind {
        ErrorKind::Transient if attempt >= MAX_RETRIES => {
            warn!(
                attempt,
                max_retries = MAX_RETRIES,
                "Max retries exceeded, waiting for resource change"
            );
            None
        }
        ErrorKind::Transient => {
            // 5s, 10s, 20s, 40s, ... up to 1 hour
            let delay_secs = BASE_DELAY_SECS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
            Some(Duration::from_secs(delay_secs.min(MAX_DELAY_SECS)))
        }
        ErrorKind::Permanent => None,
    }
}

/// Requeue action for a failed pass.
///
/// `floor` is the rate limiter's remaining window, rounded up to whole
/// seconds; a transient retry is never scheduled before it.
pub fn compute_backoff(attempt: u32, kind: ErrorKind, floor: Option<Duration>) -> Action {
    match backoff_delay(attempt, kind) {
        Some(delay) => {
            let delay = floor.map_or(delay, |floor| delay.max(ceil_secs(floor)));
            debug!(
                attempt,
                delay_secs = delay.as_secs(),
                "Scheduling retry with exponential backoff"
            );
            Action::requeue(delay)
        }
        None => {
            debug!(attempt, error_kind = ?kind, "Waiting for resource change");
            Action::await_change()
        }
    }
}

fn ceil_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs() + u64::from(d.subsec_nanos() > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web() -> ServiceKey {
        ServiceKey::new("default", "web")
    }

    #[test]
    fn test_retry_tracker() {
        let tracker = RetryTracker::new();

        assert_eq!(tracker.get(&web()), 0);
        assert_eq!(tracker.increment(&web()), 1);
        assert_eq!(tracker.increment(&web()), 2);
        assert_eq!(tracker.get(&ServiceKey::new("default", "api")), 0);

        tracker.reset(&web());
        assert_eq!(tracker.get(&web()), 0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let delays: Vec<_> = (1..=4)
            .map(|attempt| backoff_delay(attempt, ErrorKind::Transient).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);

        assert_eq!(
            backoff_delay(MAX_RETRIES - 1, ErrorKind::Transient),
            Some(Duration::from_secs(1280))
        );
    }

    #[test]
    fn test_max_retries_waits_for_change() {
        assert_eq!(backoff_delay(MAX_RETRIES, ErrorKind::Transient), None);
        assert_eq!(
            compute_backoff(MAX_RETRIES, ErrorKind::Transient, None),
            Action::await_change()
        );
    }

    #[test]
    fn test_permanent_waits_for_change() {
        assert_eq!(
            compute_backoff(1, ErrorKind::Permanent, Some(Duration::from_secs(60))),
            Action::await_change()
        );
    }

    #[test]
    fn test_rate_limit_window_is_a_floor() {
        assert_eq!(
            compute_backoff(1, ErrorKind::Transient, Some(Duration::from_secs(60))),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            compute_backoff(5, ErrorKind::Transient, Some(Duration::from_secs(60))),
            Action::requeue(Duration::from_secs(80))
        );
        assert_eq!(
            compute_backoff(1, ErrorKind::Transient, None),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            compute_backoff(1, ErrorKind::Transient, Some(Duration::from_millis(59_250))),
            Action::requeue(Duration::from_secs(60))
        );
    }
}
