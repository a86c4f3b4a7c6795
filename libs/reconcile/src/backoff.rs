//! Per-key exponential backoff.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use rand::Rng;

/// Default base delay for the first retry of a key.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default ceiling for a single retry delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    ///
    /// The result never exceeds `max`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max.as_nanos();
        let factor = 1u128 << attempt.min(64);
        let delay = self
            .base
            .as_nanos()
            .checked_mul(factor)
            .map_or(max, |d| d.min(max));

        let nanos = if self.jitter > 0.0 {
            let delay = delay as f64;
            let range = delay * self.jitter.min(1.0);
            let jittered = delay + rand::rng().random_range(-range..=range);
            (jittered.max(0.0) as u128).min(max)
        } else {
            delay
        };

        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Tracks failures per key and hands out growing delays.
#[derive(Debug)]
pub struct ItemBackoff<K> {
    policy: BackoffPolicy,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemBackoff<K> {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Records a failure for `key` and returns how long to wait before retrying.
    pub fn when(&mut self, key: &K) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Clears failure tracking for a key.
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Number of failures recorded since the last `forget`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
