//! Retry policy and exponential backoff
//!
//! The delay before retry `i` (0-based) is `min(base * factor^i, max)`.
//! With the default zero jitter the schedule is fully deterministic.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many times to retry and how long to wait between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(rename = "base_delay_ms", with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Cap applied to every delay
    #[serde(rename = "max_delay_ms", with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Multiplier per retry
    pub backoff_factor: f64,
    /// Random spread as a fraction of the delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Quick retries for interactive calls
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 1.5,
            jitter: 0.0,
        }
    }

    /// Few, widely spaced retries
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 3.0,
            jitter: 0.0,
        }
    }

    /// Set retry count
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set jitter fraction (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `attempt` (0-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;

        if !scaled.is_finite() || scaled >= cap {
            return self.max_delay;
        }
        Duration::from_nanos(scaled.max(0.0).round() as u64)
    }

    /// Delay before retry `attempt` with jitter applied, still capped
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0)).min(self.max_delay)
    }

    /// Iterator over every retry delay this policy allows
    pub fn delays(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }
}

/// Exponential backoff iterator yielding one delay per allowed retry
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff instance
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Retries consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if more retries are allowed
    pub fn can_retry(&self) -> bool {
        self.attempt < self.policy.max_retries
    }

    /// Get remaining retries
    pub fn remaining(&self) -> u32 {
        self.policy.max_retries.saturating_sub(self.attempt)
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.can_retry() {
            return None;
        }
        let delay = self.policy.jittered_delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
