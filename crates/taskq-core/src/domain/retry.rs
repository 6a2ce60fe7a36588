//! Retry policy: decides how long a RETRY entry waits before it is eligible again.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff applied to entries put back on the queue after a failed run.
///
/// The default policy retries immediately, matching a queue with no backoff:
/// a RETRY entry is eligible on the very next poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default)]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Hard ceiling on retries, applied even to unlimited budgets.
    #[serde(default)]
    pub ceiling: Option<u32>,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            ceiling: None,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            ..Self::default()
        }
    }

    /// Delay before the next attempt of an entry that has failed `retries + 1`
    /// times so far (`retries` is the counter before increment).
    ///
    /// delay = base_delay * multiplier^retries, capped at `max_delay`.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - retries 0: 2s
    /// - retries 1: 4s
    /// - retries 2: 8s
    pub fn next_delay(&self, retries: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::ZERO);
        assert_eq!(policy.next_delay(5), Duration::ZERO);
        assert_eq!(policy.ceiling, None);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0);

        let d1 = policy.next_delay(0);
        let d2 = policy.next_delay(1);
        let d3 = policy.next_delay(2);

        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        assert_eq!(d3, Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::exponential(Duration::from_secs(2), 2.0)
        };
        assert_eq!(policy.next_delay(3), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }
}
