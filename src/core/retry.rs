//! Bounded exponential backoff for reopening change streams

use serde::Deserialize;
use std::time::Duration;

/// Retry configuration for watches whose cursor failed
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RetryPolicy {
    /// Maximum number of reopen attempts before the watch is reported as failed
    pub max_retries: u32,
    /// Delay before the first reopen attempt (in milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay (in milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up on the first failure
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failed attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // cap the exponent so powi cannot overflow into inf
        let exponent = attempt.min(30) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(delay_ms)
    }
}
