//! Per-Service suppression of repeated identical errors
//!
//! The first occurrence of an error is always surfaced. Repeats of the same
//! error (by content hash) are surfaced again only after a growing wait
//! taken from [`LADDER`]. A different error for the same key starts over,
//! so a new failure mode is never hidden behind an old one's backoff.
//!
//! Suppressed repeats only bump the occurrence count; the ladder advances
//! each time an error is surfaced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Wait before re-surfacing the same error: immediate, 1m, 5m, 15m, 60m
pub const LADDER: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
    Duration::from_secs(3600),
];

/// Entries not touched for this long are purged by the sweep
pub const IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug)]
struct ErrorEntry {
    last_error: String,
    hash: String,
    count: u64,
    /// `count` at the last surfacing
    surfaced_count: u64,
    /// Index into [`LADDER`] for the next surfacing
    index: usize,
    last_surfaced: Instant,
    last_seen: Instant,
}

impl ErrorEntry {
    fn new(error: &str, hash: String, now: Instant) -> Self {
        Self {
            last_error: error.to_string(),
            hash,
            count: 1,
            surfaced_count: 1,
            index: 1,
            last_surfaced: now,
            last_seen: now,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        LADDER[self.index].saturating_sub(now.saturating_duration_since(self.last_surfaced))
    }
}

/// Outcome of [`ErrorRateLimiter::filter_for_reconcile`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Log the error and let it reach the controller's retry machinery
    pub surface: bool,
    /// Remaining backoff for a suppressed repeat
    pub requeue_after: Option<Duration>,
    /// Occurrences of this error so far
    pub count: u64,
    /// Occurrences since the previous surfacing, this one included
    pub since_surfaced: u64,
}

impl Decision {
    fn first() -> Self {
        Self {
            surface: true,
            requeue_after: None,
            count: 1,
            since_surfaced: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct ErrorRateLimiter {
    entries: RwLock<HashMap<String, ErrorEntry>>,
}

fn content_hash(error: &str) -> String {
    hex::encode(Sha256::digest(error.as_bytes()))
}

impl ErrorRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `error` for `key` should be logged now
    pub fn should_log(&self, key: &str, error: &str) -> bool {
        self.observe_at(key, error, Instant::now()).surface
    }

    /// Record `error` and decide whether to surface it, with a requeue hint
    pub fn filter_for_reconcile(&self, key: &str, error: &str) -> Decision {
        self.observe_at(key, error, Instant::now())
    }

    pub fn observe_at(&self, key: &str, error: &str, now: Instant) -> Decision {
        let hash = content_hash(error);
        let mut entries = self.entries.write();

        let entry = match entries.get_mut(key) {
            Some(entry) if entry.hash == hash => entry,
            Some(entry) => {
                debug!(key = %key, previous = %entry.last_error, "New error for key, resetting backoff");
                *entry = ErrorEntry::new(error, hash, now);
                return Decision::first();
            }
            None => {
                entries.insert(key.to_string(), ErrorEntry::new(error, hash, now));
                return Decision::first();
            }
        };

        entry.count += 1;
        entry.last_seen = now;

        let remaining = entry.remaining(now);
        let since_surfaced = entry.count - entry.surfaced_count;
        if remaining.is_zero() {
            entry.last_surfaced = now;
            entry.surfaced_count = entry.count;
            entry.index = (entry.index + 1).min(LADDER.len() - 1);
            Decision {
                surface: true,
                requeue_after: None,
                count: entry.count,
                since_surfaced,
            }
        } else {
            Decision {
                surface: false,
                requeue_after: Some(remaining),
                count: entry.count,
                since_surfaced,
            }
        }
    }

    /// Backoff left before `key`'s current error surfaces again
    pub fn remaining_backoff(&self, key: &str) -> Option<Duration> {
        self.remaining_backoff_at(key, Instant::now())
    }

    pub fn remaining_backoff_at(&self, key: &str, now: Instant) -> Option<Duration> {
        self.entries
            .read()
            .get(key)
            .map(|e| e.remaining(now))
            .filter(|d| !d.is_zero())
    }

    /// Wait required between the last surfacing and the next one
    pub fn required_wait(&self, key: &str) -> Option<Duration> {
        self.entries.read().get(key).map(|e| LADDER[e.index])
    }

    /// Forget `key`, e.g. after a successful pass
    pub fn reset(&self, key: &str) {
        if self.entries.write().remove(key).is_some() {
            debug!(key = %key, "Cleared error backoff");
        }
    }

    /// Drop entries idle for at least `ttl`
    pub fn purge_idle(&self, ttl: Duration) -> usize {
        self.purge_idle_at(Instant::now(), ttl)
    }

    pub fn purge_idle_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_seen) < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "default/web";

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_ladder_scenario() {
        let limiter = ErrorRateLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.observe_at(KEY, "E", t0).surface);

        let repeat = limiter.observe_at(KEY, "E", t0);
        assert!(!repeat.surface);
        assert_eq!(repeat.requeue_after, Some(secs(60.0)));
        assert_eq!(repeat.count, 2);

        assert!(limiter.observe_at(KEY, "E", t0 + secs(61.0)).surface);

        let other = limiter.observe_at(KEY, "F", t0 + secs(61.5));
        assert!(other.surface);
        assert_eq!(other.count, 1);
        assert_eq!(limiter.required_wait(KEY), Some(LADDER[1]));
    }

    #[test]
    fn test_suppressed_repeats_are_counted_at_next_surfacing() {
        let limiter = ErrorRateLimiter::new();
        let t0 = Instant::now();

        assert_eq!(limiter.observe_at(KEY, "E", t0).since_surfaced, 1);
        assert_eq!(limiter.observe_at(KEY, "E", t0 + secs(1.0)).since_surfaced, 1);
        assert_eq!(limiter.observe_at(KEY, "E", t0 + secs(2.0)).since_surfaced, 2);

        let surfaced = limiter.observe_at(KEY, "E", t0 + secs(61.0));
        assert!(surfaced.surface);
        assert_eq!(surfaced.count, 4);
        assert_eq!(surfaced.since_surfaced, 3);

        // Counting restarts after each surfacing
        assert_eq!(limiter.observe_at(KEY, "E", t0 + secs(62.0)).since_surfaced, 1);
    }

    #[test]
    fn test_ladder_caps_at_last_rung() {
        let limiter = ErrorRateLimiter::new();
        let mut now = Instant::now();
        limiter.observe_at(KEY, "E", now);

        for _ in 0..10 {
            now += LADDER[4];
            assert!(limiter.observe_at(KEY, "E", now).surface);
        }
        assert_eq!(limiter.required_wait(KEY), Some(LADDER[4]));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = ErrorRateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.observe_at("default/a", "E", t0).surface);
        assert!(limiter.observe_at("default/b", "E", t0).surface);
        assert!(!limiter.observe_at("default/a", "E", t0).surface);
    }

    #[test]
    fn test_remaining_backoff() {
        let limiter = ErrorRateLimiter::new();
        let t0 = Instant::now();
        assert_eq!(limiter.remaining_backoff_at(KEY, t0), None);

        limiter.observe_at(KEY, "E", t0);
        assert_eq!(limiter.remaining_backoff_at(KEY, t0 + secs(20.0)), Some(secs(40.0)));
        assert_eq!(limiter.remaining_backoff_at(KEY, t0 + secs(60.0)), None);
    }

    #[test]
    fn test_reset_and_purge() {
        let limiter = ErrorRateLimiter::new();
        let t0 = Instant::now();
        limiter.observe_at("default/a", "E", t0);
        limiter.observe_at("default/b", "E", t0 + secs(3600.0));

        limiter.reset("default/missing");
        assert_eq!(limiter.len(), 2);

        assert_eq!(limiter.purge_idle_at(t0 + IDLE_TTL, IDLE_TTL), 1);
        assert_eq!(limiter.len(), 1);

        limiter.reset("default/b");
        assert!(limiter.is_empty());
        // Reset key surfaces again immediately
        assert!(limiter.observe_at("default/b", "E", t0 + secs(3601.0)).surface);
    }

    proptest! {
        /// Waits between surfacings never shrink for one error, and a new
        /// error always surfaces immediately
        #[test]
        fn proptest_backoff_monotonic(gaps in proptest::collection::vec(0u64..1200, 1..80), switch_at in 0usize..80) {
            let limiter = ErrorRateLimiter::new();
            let t0 = Instant::now();
            let mut now = t0;
            let mut last_surfaced = t0;
            let mut last_wait = Duration::ZERO;
            prop_assert!(limiter.observe_at(KEY, "E", now).surface);

            for (i, gap) in gaps.iter().enumerate() {
                now += Duration::from_secs(*gap);
                if i == switch_at {
                    prop_assert!(limiter.observe_at(KEY, "F", now).surface);
                    return Ok(());
                }

                let required = limiter.required_wait(KEY).unwrap_or_default();
                let decision = limiter.observe_at(KEY, "E", now);
                if decision.surface {
                    prop_assert!(now - last_surfaced >= required);
                    prop_assert!(required >= last_wait);
                    last_wait = required;
                    last_surfaced = now;
                } else {
                    prop_assert!(now - last_surfaced < required);
                }
            }
        }
    }
}
