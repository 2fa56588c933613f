//! # sessiond Traits
//!
//! This crate provides the domain models and the collaborator traits the
//! sessiond resilience layer is written against. Concrete backends (a hosted
//! identity service, a REST profile table, browser storage, the runtime's
//! online/offline events) implement these traits; the core never talks to a
//! transport directly.
//!
//! ## Core Traits
//!
//! - [`IdentityBackend`] - sign-in, sign-up, sign-out, refresh, session lookup
//! - [`ProfileStore`] - fetch and insert per-user profile rows
//! - [`KeyValueStore`] - local persistence for recovery snapshots
//! - [`ConnectivitySource`] - runtime-level online/offline event source
//!
//! ## Example
//!
//! ```ignore
//! use sessiond_traits::prelude::*;
//!
//! async fn who_am_i<B: IdentityBackend>(backend: &B) -> Result<Option<UserId>, BackendError> {
//!     Ok(backend.current_session().await?.map(|s| s.user.id))
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sessiond_error::SessionError;
use std::fmt;
use std::time::SystemTime;

/// Stable identifier of an authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Creates a new UserId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Email/password pair submitted for sign-in
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account email
    pub email: String,
    /// Plain-text password, never logged
    pub password: String,
}

impl Credentials {
    /// Creates a credential pair
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Account creation request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRequest {
    /// Credentials for the new account
    pub credentials: Credentials,
    /// Optional display name stored as user metadata
    pub display_name: Option<String>,
}

impl SignUpRequest {
    /// Creates a sign-up request without a display name
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(email, password),
            display_name: None,
        }
    }

    /// Sets the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

impl fmt::Debug for SignUpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignUpRequest")
            .field("credentials", &self.credentials)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// The user as the identity backend describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id
    pub id: UserId,
    /// Primary email, if the backend exposes one
    pub email: Option<String>,
    /// Display name from user metadata
    pub display_name: Option<String>,
}

impl Identity {
    /// Creates an identity with only an id
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
        }
    }

    /// Sets the email
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// An authenticated session issued by the identity backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// The signed-in user
    pub user: Identity,
    /// Bearer token for API calls
    pub access_token: String,
    /// Token used to obtain a fresh session
    pub refresh_token: String,
    /// When the access token stops being accepted
    pub expires_at: Option<SystemTime>,
}

impl AuthSession {
    /// Returns true if the access token has expired at `now`
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("user", &self.user)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A per-user profile row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Same id as the owning user
    pub id: UserId,
    /// Contact email
    pub email: Option<String>,
    /// Name shown in the UI
    pub display_name: Option<String>,
    /// Avatar location
    pub avatar_url: Option<String>,
    /// Row creation time
    pub created_at: SystemTime,
}

/// Row inserted when a user has no profile yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProfile {
    /// Owning user id (primary key)
    pub id: UserId,
    /// Contact email
    pub email: Option<String>,
    /// Name shown in the UI
    pub display_name: Option<String>,
    /// Row creation time
    pub created_at: SystemTime,
}

impl NewProfile {
    /// Builds the defaulted row for an identity.
    ///
    /// The display name falls back to the local part of the email.
    pub fn for_identity(identity: &Identity, now: SystemTime) -> Self {
        let display_name = identity
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| {
                identity
                    .email
                    .as_deref()
                    .and_then(|email| email.split('@').next())
                    .filter(|local| !local.is_empty())
                    .map(str::to_string)
            });

        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            display_name,
            created_at: now,
        }
    }

    /// The profile this row becomes once stored
    pub fn into_profile(self) -> Profile {
        Profile {
            id: self.id,
            email: self.email,
            display_name: self.display_name,
            avatar_url: None,
            created_at: self.created_at,
        }
    }
}

/// Opaque failure reported by a remote collaborator.
///
/// Converted into a tagged [`SessionError`] at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    /// HTTP-like status, when the transport has one
    pub status: Option<u16>,
    /// Backend-specific code (e.g. a SQLSTATE)
    pub code: Option<String>,
    /// Raw message
    pub message: String,
}

impl BackendError {
    /// Creates an error from a message only
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// Creates an error with a status code
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    /// Sets the backend code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        SessionError::from_external(err.status, err.code.as_deref(), err.message)
    }
}

/// Result type for remote collaborator calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Remote identity service
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Exchanges credentials for a session
    async fn sign_in(&self, credentials: &Credentials) -> BackendResult<AuthSession>;

    /// Creates an account and returns its first session
    async fn sign_up(&self, request: &SignUpRequest) -> BackendResult<AuthSession>;

    /// Revokes the session owning `access_token`
    async fn sign_out(&self, access_token: &str) -> BackendResult<()>;

    /// Exchanges a refresh token for a fresh session
    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<AuthSession>;

    /// Returns the session the backend currently holds, if any
    async fn current_session(&self) -> BackendResult<Option<AuthSession>>;
}

/// Remote profile table
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetches the profile for a user; `Ok(None)` when no row exists
    async fn fetch_profile(&self, user_id: &UserId) -> BackendResult<Option<Profile>>;

    /// Inserts a row. Must fail with a conflict signal if the id exists.
    async fn insert_profile(&self, profile: &NewProfile) -> BackendResult<Profile>;
}

/// Local persistent key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a value
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;

    /// Writes a value, replacing any previous one
    async fn put(&self, key: &str, value: String) -> Result<(), SessionError>;

    /// Deletes a value; missing keys are not an error
    async fn remove(&self, key: &str) -> Result<(), SessionError>;
}

/// Runtime-level online/offline event source
pub trait ConnectivitySource: Send + Sync {
    /// Current connectivity as reported by the runtime
    fn current(&self) -> bool;

    /// Stream of connectivity values; may repeat identical values
    fn watch(&self) -> tokio::sync::watch::Receiver<bool>;
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AuthSession, BackendError, BackendResult, ConnectivitySource, Credentials, Identity,
        IdentityBackend, KeyValueStore, NewProfile, Profile, ProfileStore, SignUpRequest, UserId,
    };
}
