//! Configuration for the session layer components

use serde::{Deserialize, Serialize};
use sessiond_error::SessionError;
use sessiond_resilience::{serde_millis, CircuitBreakerConfig, RetryPolicy, TimeoutOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the [`SessionOrchestrator`](crate::SessionOrchestrator)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-attempt timeout for auth calls
    pub timeout: TimeoutOptions,
    /// Retry policy for auth calls
    pub retry: RetryPolicy,
    /// Circuit breaker guarding the identity backend
    pub circuit: CircuitBreakerConfig,
    /// Interval of the periodic health log; `None` disables it
    #[serde(
        rename = "health_log_interval_ms",
        with = "optional_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_log_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutOptions::development(),
            retry: RetryPolicy::default(),
            circuit: CircuitBreakerConfig::new("identity"),
            health_log_interval: None,
        }
    }
}

impl OrchestratorConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = TimeoutOptions::new(timeout);
        self
    }

    /// Sets the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker config
    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Enables the periodic health log
    pub fn with_health_log_interval(mut self, interval: Duration) -> Self {
        self.health_log_interval = Some(interval);
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        validate_timeout("orchestrator.timeout", &self.timeout)?;
        validate_retry("orchestrator.retry", &self.retry)?;
        if self.circuit.failure_threshold == 0 {
            return Err(SessionError::validation(
                "orchestrator.circuit.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.circuit.reset_timeout.is_zero() {
            return Err(SessionError::validation(
                "orchestrator.circuit.reset_timeout",
                "must be positive",
            ));
        }
        if self.health_log_interval.is_some_and(|d| d.is_zero()) {
            return Err(SessionError::validation(
                "orchestrator.health_log_interval",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Settings for the [`ProfileProvisioner`](crate::ProfileProvisioner)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Per-attempt timeout for profile calls
    pub timeout: TimeoutOptions,
    /// Retry policy for profile calls
    pub retry: RetryPolicy,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutOptions::development(),
            retry: RetryPolicy::new().with_max_retries(2),
        }
    }
}

impl ProvisioningConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        validate_timeout("provisioning.timeout", &self.timeout)?;
        validate_retry("provisioning.retry", &self.retry)
    }
}

/// Settings for the [`SessionInitializer`](crate::SessionInitializer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializerConfig {
    /// Outer bound on the whole initialization
    #[serde(rename = "safety_timeout_ms", with = "serde_millis")]
    pub safety_timeout: Duration,
    /// Bound on the session lookup, retries included
    #[serde(rename = "operation_timeout_ms", with = "serde_millis")]
    pub operation_timeout: Duration,
    /// Retry policy for the session lookup
    pub retry: RetryPolicy,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl InitializerConfig {
    /// Development timeouts: 5s safety, 10s lookup
    pub fn development() -> Self {
        Self {
            safety_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(10),
            retry: Self::lookup_retry(),
        }
    }

    /// Production timeouts: 5s safety, 35s lookup
    pub fn production() -> Self {
        Self {
            safety_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(35),
            retry: Self::lookup_retry(),
        }
    }

    /// Two quick retries; both fit inside the safety timeout
    fn lookup_retry() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(1))
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.safety_timeout.is_zero() {
            return Err(SessionError::validation(
                "initializer.safety_timeout",
                "must be positive",
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(SessionError::validation(
                "initializer.operation_timeout",
                "must be positive",
            ));
        }
        validate_retry("initializer.retry", &self.retry)
    }
}

/// Settings for recovery snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Whether snapshots are written at all
    pub enabled: bool,
    /// How often the writer persists a snapshot
    #[serde(rename = "interval_ms", with = "serde_millis")]
    pub interval: Duration,
    /// Messages kept in each snapshot
    pub max_messages: usize,
    /// Storage key of the snapshot
    pub key: String,
    /// Directory for file-backed storage; `None` keeps snapshots in memory
    pub directory: Option<PathBuf>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            max_messages: 10,
            key: "session-recovery".to_string(),
            directory: None,
        }
    }
}

impl RecoveryConfig {
    /// Disabled recovery
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval.is_zero() {
            return Err(SessionError::validation("recovery.interval", "must be positive"));
        }
        if self.key.trim().is_empty() {
            return Err(SessionError::validation("recovery.key", "must not be empty"));
        }
        Ok(())
    }
}

fn validate_timeout(field: &str, timeout: &TimeoutOptions) -> Result<(), SessionError> {
    if timeout.timeout.is_zero() {
        return Err(SessionError::validation(field, "must be positive"));
    }
    Ok(())
}

fn validate_retry(field: &str, retry: &RetryPolicy) -> Result<(), SessionError> {
    if retry.backoff_factor.is_nan() || retry.backoff_factor < 1.0 {
        return Err(SessionError::validation(
            format!("{field}.backoff_factor"),
            "must be at least 1.0",
        ));
    }
    if retry.base_delay > retry.max_delay {
        return Err(SessionError::validation(
            format!("{field}.base_delay"),
            "must not exceed max_delay",
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(SessionError::validation(
            format!("{field}.jitter"),
            "must be between 0.0 and 1.0",
        ));
    }
    Ok(())
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => sessiond_resilience::serde_millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
