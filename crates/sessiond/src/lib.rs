//! # sessiond - Client-Side Session Resilience
//!
//! sessiond keeps a client's session state consistent while the network and
//! the identity backend misbehave. It combines a connectivity monitor,
//! timeout and retry primitives, a circuit breaker, request deduplication and
//! race-free profile provisioning behind one application root.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `default` | `toml-config` + `logging` |
//! | `toml-config` | `SessiondConfig::from_toml_str` |
//! | `logging` | `init_tracing` fmt subscriber helper |
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! sessiond = "0.1"
//!
//! # Without TOML or the subscriber helper
//! sessiond = { version = "0.1", default-features = false }
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sessiond::prelude::*;
//!
//! sessiond::init_tracing(None);
//!
//! let layer = Sessiond::new(
//!     SessiondConfig::for_environment(Environment::Production),
//!     Collaborators::new(identity_backend, profile_store),
//! )?;
//!
//! match layer.start().await {
//!     SessionStatus::Ready => println!("welcome back"),
//!     SessionStatus::NoSession => println!("please sign in"),
//!     _ => println!("{:?}", layer.session().last_error),
//! }
//!
//! if let Err(err) = layer.sign_in(&Credentials::new("jane@example.com", "secret")).await {
//!     let shown = err.to_user_facing();
//!     println!("{} (retry: {})", shown.message, shown.can_retry);
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;
#[cfg(feature = "logging")]
#[cfg_attr(docsrs, doc(cfg(feature = "logging")))]
pub mod logging;

// ============================================================================
// Component crate re-exports
// ============================================================================

pub use sessiond_auth as auth;
pub use sessiond_error as error;
pub use sessiond_resilience as resilience;
pub use sessiond_traits as traits;

pub use app::{Collaborators, Sessiond};
pub use config::{ConfigError, Environment, SessiondConfig};
#[cfg(feature = "logging")]
pub use logging::init_tracing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Collaborators, ConfigError, Environment, Sessiond, SessiondConfig};

    pub use sessiond_auth::{
        AuthEvent, EventDisposition, ProvisionOutcome, SessionRecord, SessionStatus,
    };
    pub use sessiond_error::{ErrorCode, SessionError, UserFacingError};
    pub use sessiond_resilience::{
        CircuitState, ConnectivityEvent, HealthSnapshot, HealthStatus, RetryPolicy,
        TimeoutOptions,
    };
    pub use sessiond_traits::{
        AuthSession, ConnectivitySource, Credentials, Identity, IdentityBackend, KeyValueStore,
        Profile, ProfileStore, SignUpRequest, UserId,
    };
}

// ============================================================================
// Version information
// ============================================================================

/// Returns the sessiond version
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
