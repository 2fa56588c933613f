//! Application configuration
//!
//! [`SessiondConfig`] aggregates the per-component settings. Every field has
//! a default, so a config file only names what it changes. Durations are
//! written in milliseconds (`timeout_ms`, `reset_timeout_ms`, ...).
//!
//! ```toml
//! initially_online = true
//!
//! [orchestrator.retry]
//! max_retries = 5
//!
//! [orchestrator.circuit]
//! failure_threshold = 3
//!
//! [recovery]
//! directory = "/var/lib/app/recovery"
//! ```

use serde::{Deserialize, Serialize};
use sessiond_auth::{InitializerConfig, OrchestratorConfig, ProvisioningConfig, RecoveryConfig};
use sessiond_error::SessionError;
use sessiond_resilience::TimeoutOptions;
use std::path::Path;
use thiserror::Error;

/// Deployment flavour selecting timeout presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// 10s operation timeouts
    #[default]
    Development,
    /// 35s operation timeouts
    Production,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed TOML
    #[cfg(feature = "toml-config")]
    #[error("Parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Unknown file extension
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Values parsed but do not make sense together
    #[error("Validation failed: {0}")]
    Invalid(#[from] SessionError),
}

/// Settings for the whole session layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessiondConfig {
    /// Connectivity assumed before any source reports
    pub initially_online: bool,
    /// Auth call handling
    pub orchestrator: OrchestratorConfig,
    /// Profile fetch/insert handling
    pub provisioning: ProvisioningConfig,
    /// Startup deadlines
    pub initializer: InitializerConfig,
    /// Recovery snapshots
    pub recovery: RecoveryConfig,
}

impl Default for SessiondConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

impl SessiondConfig {
    /// Defaults for `environment`
    pub fn for_environment(environment: Environment) -> Self {
        let (timeout, initializer) = match environment {
            Environment::Development => {
                (TimeoutOptions::development(), InitializerConfig::development())
            }
            Environment::Production => {
                (TimeoutOptions::production(), InitializerConfig::production())
            }
        };

        Self {
            initially_online: true,
            orchestrator: OrchestratorConfig {
                timeout: timeout.clone(),
                ..OrchestratorConfig::default()
            },
            provisioning: ProvisioningConfig {
                timeout,
                ..ProvisioningConfig::default()
            },
            initializer,
            recovery: RecoveryConfig::default(),
        }
    }

    /// Parse and validate JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` or `.toml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            #[cfg(feature = "toml-config")]
            Some("toml") => Self::from_toml_str(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), SessionError> {
        self.orchestrator.validate()?;
        self.provisioning.validate()?;
        self.initializer.validate()?;
        self.recovery.validate()
    }
}
