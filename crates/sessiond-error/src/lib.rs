//! # sessiond Error
//!
//! This crate provides the unified error type for the sessiond client-side
//! resilience layer. Every failure the UI layer can observe is a
//! [`SessionError`] carrying a stable [`ErrorCode`], a message and a
//! `can_retry` hint.
//!
//! ## Error Categories
//!
//! - [`ErrorKind::Validation`] - bad local input, never retried, never hits the network
//! - [`ErrorKind::Network`] / [`ErrorKind::Timeout`] - transient, retried silently
//! - [`ErrorKind::ServiceUnavailable`] - 5xx-class failures, retried up to policy
//! - [`ErrorKind::CircuitOpen`] - fast-failed by the circuit breaker
//! - [`ErrorKind::Auth`] - invalid credentials / unauthorized, surfaced immediately
//! - [`ErrorKind::Conflict`] - uniqueness violation, recovered locally
//!
//! Opaque failures from remote collaborators are translated exactly once, at
//! the boundary, by [`ErrorKind::classify`]. All downstream logic switches on
//! the [`ErrorKind`] tag instead of re-parsing messages.
//!
//! ## Example
//!
//! ```
//! use sessiond_error::{Classify, ErrorKind, SessionError};
//!
//! let err = SessionError::from_external(Some(503), None, "upstream down");
//! assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
//! assert!(err.kind().is_retryable());
//!
//! let err = SessionError::from_external(None, None, "Invalid login credentials");
//! assert_eq!(err.kind(), ErrorKind::Auth);
//! assert!(!err.can_retry());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Postgres `unique_violation` SQLSTATE, surfaced verbatim by REST backends.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

/// PostgREST code for "zero rows returned where one was expected".
pub const NO_ROWS_CODE: &str = "PGRST116";

/// Tag describing what kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Local input rejected before any network call
    Validation,
    /// Device reported no connectivity
    Offline,
    /// Transport-level failure (fetch failed, connection reset, DNS)
    Network,
    /// Deadline elapsed before the operation settled
    Timeout,
    /// 5xx-class or rate-limited response
    ServiceUnavailable,
    /// Call rejected by an open circuit breaker
    CircuitOpen,
    /// Invalid credentials, unauthorized or forbidden
    Auth,
    /// Uniqueness violation
    Conflict,
    /// Requested record does not exist
    NotFound,
    /// Local persistence failure
    Storage,
    /// Anything the classifier could not recognise
    Unknown,
}

impl ErrorKind {
    /// Whether the retry executor may try again after this kind of failure.
    ///
    /// Unclassified failures default to retryable.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::ServiceUnavailable
                | ErrorKind::Unknown
        )
    }

    /// Whether this failure says something about the health of the remote
    /// service and therefore feeds the circuit breaker.
    pub fn counts_against_circuit(self) -> bool {
        self.is_retryable()
    }

    /// Translate an opaque external failure into a kind.
    ///
    /// This is the only place in the workspace that inspects status codes and
    /// message text. Status codes win over backend codes, which win over
    /// message heuristics.
    pub fn classify(status: Option<u16>, code: Option<&str>, message: &str) -> Self {
        if let Some(status) = status {
            match status {
                409 => return ErrorKind::Conflict,
                401 | 403 => return ErrorKind::Auth,
                404 => return ErrorKind::NotFound,
                408 => return ErrorKind::Timeout,
                429 => return ErrorKind::ServiceUnavailable,
                500..=599 => return ErrorKind::ServiceUnavailable,
                _ => {}
            }
        }

        match code {
            Some(UNIQUE_VIOLATION_CODE) => return ErrorKind::Conflict,
            Some(NO_ROWS_CODE) => return ErrorKind::NotFound,
            _ => {}
        }

        let msg = message.to_lowercase();

        if msg.contains("duplicate key")
            || msg.contains("already exists")
            || msg.contains("already registered")
            || msg.contains("unique constraint")
            || msg.contains("conflict")
        {
            return ErrorKind::Conflict;
        }

        if msg.contains("invalid credentials")
            || msg.contains("invalid login")
            || msg.contains("invalid_grant")
            || msg.contains("unauthorized")
            || msg.contains("forbidden")
            || msg.contains("jwt expired")
        {
            return ErrorKind::Auth;
        }

        if msg.contains("timeout") || msg.contains("timed out") {
            return ErrorKind::Timeout;
        }

        if msg.contains("network")
            || msg.contains("fetch")
            || msg.contains("connection")
            || msg.contains("dns")
            || msg.contains("econnrefused")
            || msg.contains("econnreset")
        {
            return ErrorKind::Network;
        }

        if msg.contains("internal server")
            || msg.contains("service unavailable")
            || msg.contains("bad gateway")
            || msg.contains("gateway")
            || msg.contains("too many requests")
            || msg.contains("rate limit")
            || contains_5xx(&msg)
        {
            return ErrorKind::ServiceUnavailable;
        }

        ErrorKind::Unknown
    }
}

fn contains_5xx(msg: &str) -> bool {
    msg.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .any(|status| (500..=599).contains(&status))
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Offline => "offline",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Auth => "auth",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Anything that can report its [`ErrorKind`].
///
/// Retry and circuit breaker logic is written against this trait.
pub trait Classify {
    /// The tag for this failure
    fn kind(&self) -> ErrorKind;
}

impl Classify for ErrorKind {
    fn kind(&self) -> ErrorKind {
        *self
    }
}

/// The main error type for sessiond operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    // ============ Local Errors ============
    /// Input failed local validation
    #[error("Invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Device is offline
    #[error("No internet connection")]
    Offline,

    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    // ============ Transient Errors ============
    /// Transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Deadline elapsed
    #[error("Operation timed out after {}ms", .duration.as_millis())]
    Timeout {
        /// Configured timeout
        duration: Duration,
    },

    /// Server-side failure
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Rejected without a network attempt because the circuit is open
    #[error(
        "Service unavailable: circuit '{}' is open, retry after {}ms",
        .name,
        .retry_after.as_millis()
    )]
    CircuitOpen {
        /// Name of the circuit breaker
        name: String,
        /// Time until a trial call will be admitted
        retry_after: Duration,
    },

    // ============ Fatal Errors ============
    /// Invalid credentials or insufficient rights
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Uniqueness violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    // ============ Generic ============
    /// Unclassified failure
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Build a validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Translate an opaque external failure into a tagged error.
    pub fn from_external(
        status: Option<u16>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        match ErrorKind::classify(status, code, &message) {
            ErrorKind::Conflict => SessionError::Conflict(message),
            ErrorKind::Auth => SessionError::Auth(message),
            ErrorKind::NotFound => SessionError::NotFound(message),
            ErrorKind::Network => SessionError::Network(message),
            ErrorKind::ServiceUnavailable => SessionError::ServiceUnavailable(message),
            // Remote timeouts carry no local duration.
            ErrorKind::Timeout => SessionError::Network(message),
            _ => SessionError::Other(message),
        }
    }

    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Validation { .. } => ErrorCode::Validation,
            SessionError::Offline => ErrorCode::Offline,
            SessionError::Storage(_) => ErrorCode::Storage,
            SessionError::Network(_) => ErrorCode::Network,
            SessionError::Timeout { .. } => ErrorCode::Timeout,
            SessionError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            SessionError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            SessionError::Auth(_) => ErrorCode::Auth,
            SessionError::Conflict(_) => ErrorCode::Conflict,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Hint for the user: is trying the same action again later sensible?
    ///
    /// Broader than [`ErrorKind::is_retryable`]: going back online or
    /// waiting out a circuit cooldown are things a user can do.
    pub fn can_retry(&self) -> bool {
        match self.kind() {
            ErrorKind::Offline | ErrorKind::CircuitOpen => true,
            kind => kind.is_retryable(),
        }
    }

    /// Suggested wait before retrying, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SessionError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Structured, serializable view handed to the UI layer.
    pub fn to_user_facing(&self) -> UserFacingError {
        UserFacingError {
            code: self.code(),
            message: self.to_string(),
            can_retry: self.can_retry(),
        }
    }
}

impl Classify for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation { .. } => ErrorKind::Validation,
            SessionError::Offline => ErrorKind::Offline,
            SessionError::Storage(_) => ErrorKind::Storage,
            SessionError::Network(_) => ErrorKind::Network,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            SessionError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            SessionError::Auth(_) => ErrorKind::Auth,
            SessionError::Conflict(_) => ErrorKind::Conflict,
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::Other(_) => ErrorKind::Unknown,
        }
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| SessionError::Other(format!("{}: {}", ctx.into(), e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| SessionError::Other(format!("{}: {}", f(), e)))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| SessionError::NotFound(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| SessionError::NotFound(f()))
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Storage(err.to_string())
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Local validation failed
    Validation = 1001,
    /// Device offline
    Offline = 2001,
    /// Network failure
    Network = 2002,
    /// Timed out
    Timeout = 2003,
    /// Remote service failing
    ServiceUnavailable = 3001,
    /// Circuit breaker open
    CircuitOpen = 3002,
    /// Authentication failed
    Auth = 4001,
    /// Uniqueness conflict
    Conflict = 5001,
    /// Record not found
    NotFound = 5002,
    /// Local storage failure
    Storage = 6001,
}

impl ErrorCode {
    /// Stable string form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Offline => "OFFLINE",
            ErrorCode::Network => "NETWORK",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Auth => "AUTH",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Storage => "STORAGE",
        }
    }
}

/// The single structured error shape the UI receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFacingError {
    /// Stable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether trying again later may succeed
    pub can_retry: bool,
}
