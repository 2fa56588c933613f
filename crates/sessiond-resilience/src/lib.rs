//! # sessiond Resilience
//!
//! Resilience primitives for the sessiond session layer.
//!
//! - **Connectivity Monitor**: online/offline tracking with subscriber fan-out
//! - **Timeouts**: race operations against deadlines; nested deadline scopes
//! - **Retry**: exponential backoff with error classification
//! - **Resilient Executor**: connectivity gate + retry + per-attempt timeout
//! - **Circuit Breaker**: stop calling a failing service for a cooldown
//! - **Health**: on-demand health snapshots
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessiond_resilience::{
//!     ConnectivityMonitor, ResilientExecutor, RetryPolicy, TimeoutOptions,
//! };
//! use sessiond_error::SessionError;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), SessionError> {
//! let monitor = ConnectivityMonitor::new(true);
//! let executor = ResilientExecutor::new(monitor.clone());
//!
//! let policy = RetryPolicy::new()
//!     .with_max_retries(2)
//!     .with_base_delay(Duration::from_millis(100));
//!
//! let value = executor
//!     .execute_resiliently("fetch", &TimeoutOptions::fast(), &policy, || async {
//!         // Your remote call here
//!         Ok::<_, SessionError>(42)
//!     })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use sessiond_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let cb = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("identity")
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! );
//! assert_eq!(cb.state(), CircuitState::Closed);
//! ```
//!
//! ## Backoff
//!
//! ```rust
//! use sessiond_resilience::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_retries(2)
//!     .with_base_delay(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_secs(1));
//!
//! let delays: Vec<_> = policy.delays().collect();
//! assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit_breaker;
pub mod connectivity;
pub mod executor;
pub mod health;
pub mod retry;
pub mod serde_millis;
pub mod timeout;

// Re-export main types
pub use backoff::{ExponentialBackoff, RetryPolicy};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitOpenError, CircuitState,
};

pub use connectivity::{
    ConnectivityCallback, ConnectivityEvent, ConnectivityMonitor, ConnectivitySnapshot,
    Subscription,
};

pub use executor::{ResilientExecutor, ResilientOperation};

pub use health::{HealthSnapshot, HealthStatus};

pub use retry::{
    with_retry, with_retry_classified, KindClassifier, MessageClassifier, PredicateClassifier,
    RetryClassifier,
};

pub use timeout::{
    timeout_after, with_timeout, Deadline, DeadlineError, TimeoutCallback, TimeoutError,
    TimeoutOptions,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_circuit_breaker_creation() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.config().failure_threshold, 5);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_timeout_options() {
        assert!(TimeoutOptions::production().timeout > Duration::from_secs(30));
    }
}
