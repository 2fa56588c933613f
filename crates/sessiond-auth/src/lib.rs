//! # sessiond Auth
//!
//! Session orchestration on top of `sessiond-resilience`: deduplicated,
//! circuit-guarded authentication calls, race-free profile provisioning and
//! startup sequencing.
//!
//! ## Features
//!
//! - One in-flight request per fingerprint; identical calls share its outcome
//! - Circuit breaker fed once per logical request
//! - Pure health snapshot for the UI
//! - Exactly one profile row per user under concurrent triggers
//! - Safety-timed startup that never leaves the record `Initializing`
//! - Recovery snapshots written on an interval, read once at startup
//!
//! ## Example
//!
//! ```ignore
//! use sessiond_auth::{OrchestratorConfig, SessionOrchestrator, SessionStore};
//! use sessiond_resilience::{ConnectivityMonitor, ResilientExecutor};
//!
//! let monitor = ConnectivityMonitor::new(true);
//! let store = SessionStore::new();
//! let orchestrator = SessionOrchestrator::new(
//!     backend,
//!     ResilientExecutor::new(monitor),
//!     store.clone(),
//!     OrchestratorConfig::default(),
//! );
//!
//! let session = orchestrator.sign_in(&Credentials::new("jane@example.com", "secret")).await?;
//! println!("healthy: {}", orchestrator.get_health_status().is_healthy);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod fingerprint;
pub mod inflight;
pub mod initializer;
pub mod kv;
pub mod orchestrator;
pub mod provisioner;
pub mod recovery;
pub mod store;
pub mod validation;

pub use config::{InitializerConfig, OrchestratorConfig, ProvisioningConfig, RecoveryConfig};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use inflight::{Admission, InFlightRegistry, RequestState, SharedRequest};
pub use initializer::{AuthEvent, EventDisposition, InitPhase, SessionInitializer};
pub use kv::{FileKvStore, MemoryKvStore};
pub use orchestrator::SessionOrchestrator;
pub use provisioner::{
    KeyState, ProfileProvisioner, ProvisionOutcome, ProvisioningGuard, ProvisioningLock,
};
pub use recovery::{RecoverySnapshot, RecoveryWriter};
pub use store::{SessionRecord, SessionStatus, SessionStore};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AuthEvent, EventDisposition, ProfileProvisioner, ProvisionOutcome, SessionInitializer,
        SessionOrchestrator, SessionRecord, SessionStatus, SessionStore,
    };
}
