//! Circuit breaker pattern implementation
//!
//! Stops calls to a failing dependency for a cooldown period after repeated
//! failures. Every transition happens under one synchronous lock, so no
//! await point ever separates a check from the matching update.

use serde::{Deserialize, Serialize};
use sessiond_error::{Classify, SessionError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Circuit is half-open - one trial call is probing the service
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name for logging
    pub name: String,
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Cooldown before a trial call is admitted
    #[serde(rename = "reset_timeout_ms", with = "crate::serde_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Error when circuit is open
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit '{name}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Name of the circuit breaker
    pub name: String,
    /// Time until a trial call will be admitted
    pub retry_after: Duration,
}

impl From<CircuitOpenError> for SessionError {
    fn from(err: CircuitOpenError) -> Self {
        SessionError::CircuitOpen {
            name: err.name,
            retry_after: err.retry_after,
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitMetrics {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the circuit last opened
    pub opened_at: Option<Instant>,
    /// Time until a trial call will be admitted, when open
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Circuit breaker for preventing cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with config
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// True while calls are being refused
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Would a new call be admitted right now? Does not change state.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => match self.remaining_cooldown(&inner) {
                Some(retry_after) => Err(self.open_error(retry_after)),
                None => Ok(()),
            },
        }
    }

    /// Admit one call, moving Open to HalfOpen once the cooldown has elapsed.
    ///
    /// While HalfOpen only the single trial is admitted. A trial that never
    /// reported back is replaced after another full cooldown.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if let Some(retry_after) = self.remaining_cooldown(&inner) {
                    return Err(self.open_error(retry_after));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_started = Some(Instant::now());
                tracing::info!(
                    circuit = %self.config.name,
                    "Circuit half-open, admitting trial call"
                );
                Ok(())
            }
            CircuitState::HalfOpen => {
                let started = inner.trial_started.unwrap_or_else(Instant::now);
                let elapsed = started.elapsed();
                if inner.trial_started.is_none() || elapsed >= self.config.reset_timeout {
                    inner.trial_started = Some(Instant::now());
                    tracing::debug!(
                        circuit = %self.config.name,
                        "Admitting replacement trial call"
                    );
                    return Ok(());
                }
                Err(self.open_error(self.config.reset_timeout - elapsed))
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        Self::close(&mut inner);
        if previous != CircuitState::Closed {
            tracing::info!(circuit = %self.config.name, "Circuit closed after successful recovery");
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&mut inner);
                    tracing::warn!(
                        circuit = %self.config.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                Self::open(&mut inner);
                tracing::warn!(circuit = %self.config.name, "Circuit reopened after trial failure");
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a trial slot that produced no verdict about the service
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_started = None;
        }
    }

    /// Feed an outcome into the breaker.
    ///
    /// Service-health failures count against the circuit; rejections that
    /// never reached the service release a trial slot; anything else shows
    /// the service answering and counts as success.
    pub fn record_outcome<T>(&self, outcome: &Result<T, SessionError>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(err) if err.kind().counts_against_circuit() => self.record_failure(),
            Err(SessionError::Offline | SessionError::CircuitOpen { .. }) => self.release_trial(),
            Err(SessionError::Validation { .. }) => self.release_trial(),
            Err(_) => self.record_success(),
        }
    }

    /// Skip the remaining cooldown, letting the next call try the service
    pub fn half_open_now(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            inner.state = CircuitState::HalfOpen;
            inner.trial_started = None;
            tracing::info!(circuit = %self.config.name, "Circuit half-open ahead of cooldown");
        }
    }

    /// Execute an operation with circuit breaker protection
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SessionError>>,
    {
        self.try_acquire()?;
        let outcome = f().await;
        self.record_outcome(&outcome);
        outcome
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.lock();
        CircuitMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            retry_after: match inner.state {
                CircuitState::Open => self.remaining_cooldown(&inner),
                _ => None,
            },
        }
    }

    /// Force close the circuit (for testing/admin)
    pub fn force_close(&self) {
        Self::close(&mut self.lock());
        tracing::info!(circuit = %self.config.name, "Circuit force-closed");
    }

    /// Force open the circuit (for testing/admin)
    pub fn force_open(&self) {
        Self::open(&mut self.lock());
        tracing::warn!(circuit = %self.config.name, "Circuit force-opened");
    }

    fn open(inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_started = None;
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    fn remaining_cooldown(&self, inner: &BreakerInner) -> Option<Duration> {
        let opened = inner.opened_at?;
        let elapsed = opened.elapsed();
        (elapsed < self.config.reset_timeout).then(|| self.config.reset_timeout - elapsed)
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            name: self.config.name.clone(),
            retry_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
