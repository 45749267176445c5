//! Backoff policy shared by the task executor and checkpoint retries.
//!
//! Delay calculation is a pure function of the attempt number and a
//! jitter sample so it can be tested without a runtime or randomness.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter range 0.0-1.0; 0.2 varies each delay by +/-20%
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// A policy without any delay, for tests and local dry runs
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Capped exponential delay before retry number `attempt` (1-indexed)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped = delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }

    /// Delay before retry number `attempt`, jittered by `sample` in [0, 1).
    ///
    /// A sample of 0.5 yields exactly [`base_delay`](Self::base_delay).
    pub fn next_delay(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let factor = 1.0 + (sample.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;

        Duration::from_millis((base * factor).round().max(0.0) as u64)
    }

    /// [`next_delay`](Self::next_delay) with a random jitter sample
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.next_delay(attempt, rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(8000));
        assert_eq!(policy.base_delay(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            jitter_factor: 0.2,
            ..Default::default()
        };

        assert_eq!(policy.next_delay(1, 0.0), Duration::from_millis(800));
        assert_eq!(policy.next_delay(1, 0.5), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(1, 1.0), Duration::from_millis(1200));
    }

    #[test]
    fn test_random_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.jittered_delay(2).as_millis();
            assert!((1600..=2400).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_delay(7, 0.9), Duration::ZERO);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(30000));
    }
}
