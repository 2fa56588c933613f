//! # sessiond Testing Infrastructure
//!
//! Testing utilities for the sessiond workspace:
//! - Scripted in-memory identity backend and profile store
//! - A manually driven connectivity source
//! - [`ScriptedOperation`], which replays outcomes while counting calls
//! - Property-based testing strategies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sessiond_testing::*;
//!
//! let op = ScriptedOperation::new()
//!     .then_err(SessionError::Network("reset".into()))
//!     .then_ok(42);
//!
//! let value = with_retry("demo", &policy, || op.call()).await?;
//! assert_eq!(op.calls(), 2);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use proptest::prelude::*;
use sessiond_error::SessionError;
use sessiond_traits::{
    AuthSession, BackendError, BackendResult, ConnectivitySource, Credentials, Identity,
    IdentityBackend, NewProfile, Profile, ProfileStore, SignUpRequest, UserId,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Scripted Operations
// ============================================================================

type Step<T> = (Option<Duration>, Result<T, SessionError>);

struct ScriptInner<T> {
    steps: Mutex<VecDeque<Step<T>>>,
    calls: Mutex<Vec<Instant>>,
}

/// Replays a fixed sequence of outcomes, one per call.
///
/// Each call is recorded at the moment it is made, before any scripted delay.
/// Calls beyond the end of the script fail with [`SessionError::Other`].
pub struct ScriptedOperation<T> {
    inner: Arc<ScriptInner<T>>,
}

impl<T> Clone for ScriptedOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ScriptedOperation<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScriptedOperation<T> {
    /// Create an empty script
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                steps: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Append an immediate success
    pub fn then_ok(self, value: T) -> Self {
        self.push(None, Ok(value))
    }

    /// Append an immediate failure
    pub fn then_err(self, error: SessionError) -> Self {
        self.push(None, Err(error))
    }

    /// Append an outcome delivered after `delay`
    pub fn then_delayed(self, delay: Duration, outcome: Result<T, SessionError>) -> Self {
        self.push(Some(delay), outcome)
    }

    fn push(self, delay: Option<Duration>, outcome: Result<T, SessionError>) -> Self {
        lock(&self.inner.steps).push_back((delay, outcome));
        self
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        lock(&self.inner.calls).len()
    }

    /// When each call was made
    pub fn call_instants(&self) -> Vec<Instant> {
        lock(&self.inner.calls).clone()
    }

    /// Steps not yet consumed
    pub fn remaining(&self) -> usize {
        lock(&self.inner.steps).len()
    }
}

impl<T: Send + 'static> ScriptedOperation<T> {
    /// Consume the next step
    pub fn call(&self) -> impl Future<Output = Result<T, SessionError>> + Send + 'static {
        lock(&self.inner.calls).push(Instant::now());
        let step = lock(&self.inner.steps).pop_front();
        async move {
            match step {
                Some((delay, outcome)) => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    outcome
                }
                None => Err(SessionError::Other("script exhausted".into())),
            }
        }
    }
}

// ============================================================================
// Connectivity
// ============================================================================

/// Connectivity source driven by the test
pub struct ManualConnectivity {
    sender: watch::Sender<bool>,
    watchers: AtomicUsize,
}

impl ManualConnectivity {
    /// Create a source reporting `online`
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender,
            watchers: AtomicUsize::new(0),
        }
    }

    /// Publish a connectivity value (repeats are published too)
    pub fn set(&self, online: bool) {
        self.sender.send_replace(online);
    }

    /// How many times [`ConnectivitySource::watch`] was called
    pub fn watchers(&self) -> usize {
        self.watchers.load(Ordering::SeqCst)
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn current(&self) -> bool {
        *self.sender.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.watchers.fetch_add(1, Ordering::SeqCst);
        self.sender.subscribe()
    }
}

// ============================================================================
// Identity Backend
// ============================================================================

/// Error returned for bad credentials, shaped like a hosted auth service's
pub fn invalid_credentials() -> BackendError {
    BackendError::with_status(400, "Invalid login credentials")
}

/// Error returned for a transient server failure
pub fn server_unavailable() -> BackendError {
    BackendError::with_status(503, "Service unavailable")
}

/// Build a session for tests
pub fn session_for(user_id: &str, email: &str) -> AuthSession {
    AuthSession {
        user: Identity::new(user_id).with_email(email),
        access_token: format!("access-{user_id}"),
        refresh_token: format!("refresh-{user_id}"),
        expires_at: Some(SystemTime::now() + Duration::from_secs(3600)),
    }
}

#[derive(Default)]
struct IdentityState {
    accounts: HashMap<String, (String, Identity)>,
    failures: VecDeque<BackendError>,
    current: Option<AuthSession>,
    latency: Duration,
    current_session_delay: Option<Duration>,
}

/// In-memory identity backend with scripted failures and call counters
#[derive(Default)]
pub struct MockIdentityBackend {
    state: Mutex<IdentityState>,
    sign_in_calls: AtomicUsize,
    sign_up_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    current_session_calls: AtomicUsize,
}

impl MockIdentityBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account
    pub fn with_account(self, email: &str, password: &str, user_id: &str) -> Self {
        let identity = Identity::new(user_id).with_email(email);
        lock(&self.state)
            .accounts
            .insert(email.to_lowercase(), (password.to_string(), identity));
        self
    }

    /// Delay every mutating call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// Session reported by `current_session`
    pub fn with_current_session(self, session: AuthSession) -> Self {
        lock(&self.state).current = Some(session);
        self
    }

    /// Delay `current_session` by `delay`
    pub fn with_current_session_delay(self, delay: Duration) -> Self {
        lock(&self.state).current_session_delay = Some(delay);
        self
    }

    /// Queue a failure returned by the next call of any kind
    pub fn push_failure(&self, error: BackendError) {
        lock(&self.state).failures.push_back(error);
    }

    /// Queue `count` identical failures
    pub fn fail_next(&self, count: usize, error: BackendError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.failures.push_back(error.clone());
        }
    }

    /// Session the backend currently holds
    pub fn current(&self) -> Option<AuthSession> {
        lock(&self.state).current.clone()
    }

    /// Number of sign-in calls
    pub fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    /// Number of sign-up calls
    pub fn sign_up_calls(&self) -> usize {
        self.sign_up_calls.load(Ordering::SeqCst)
    }

    /// Number of sign-out calls
    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    /// Number of refresh calls
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of session lookups
    pub fn current_session_calls(&self) -> usize {
        self.current_session_calls.load(Ordering::SeqCst)
    }

    /// Total remote calls of any kind
    pub fn total_calls(&self) -> usize {
        self.sign_in_calls()
            + self.sign_up_calls()
            + self.sign_out_calls()
            + self.refresh_calls()
            + self.current_session_calls()
    }

    async fn enter(&self) -> BackendResult<()> {
        let (latency, failure) = {
            let mut state = lock(&self.state);
            (state.latency, state.failures.pop_front())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn issue(&self, identity: Identity) -> AuthSession {
        let session = AuthSession {
            access_token: format!("access-{}", identity.id),
            refresh_token: format!("refresh-{}", identity.id),
            expires_at: Some(SystemTime::now() + Duration::from_secs(3600)),
            user: identity,
        };
        lock(&self.state).current = Some(session.clone());
        session
    }
}

#[async_trait]
impl IdentityBackend for MockIdentityBackend {
    async fn sign_in(&self, credentials: &Credentials) -> BackendResult<AuthSession> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let account = lock(&self.state)
            .accounts
            .get(&credentials.email.to_lowercase())
            .cloned();
        match account {
            Some((password, identity)) if password == credentials.password => {
                Ok(self.issue(identity))
            }
            _ => Err(invalid_credentials()),
        }
    }

    async fn sign_up(&self, request: &SignUpRequest) -> BackendResult<AuthSession> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let email = request.credentials.email.to_lowercase();
        let identity = {
            let mut state = lock(&self.state);
            if state.accounts.contains_key(&email) {
                return Err(BackendError::with_status(422, "User already registered"));
            }
            let mut identity =
                Identity::new(format!("user-{}", state.accounts.len() + 1)).with_email(&email);
            if let Some(name) = &request.display_name {
                identity = identity.with_display_name(name);
            }
            state.accounts.insert(
                email,
                (request.credentials.password.clone(), identity.clone()),
            );
            identity
        };
        Ok(self.issue(identity))
    }

    async fn sign_out(&self, _access_token: &str) -> BackendResult<()> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        lock(&self.state).current = None;
        Ok(())
    }

    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<AuthSession> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let current = lock(&self.state).current.clone();
        match current {
            Some(session) if session.refresh_token == refresh_token => {
                Ok(self.issue(session.user))
            }
            _ => Err(BackendError::with_status(401, "Invalid refresh token")),
        }
    }

    async fn current_session(&self) -> BackendResult<Option<AuthSession>> {
        self.current_session_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, failure, current) = {
            let mut state = lock(&self.state);
            (
                state.current_session_delay,
                state.failures.pop_front(),
                state.current.clone(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(current),
        }
    }
}

// ============================================================================
// Profile Store
// ============================================================================

/// The error a Postgres-backed REST table reports for a duplicate key
pub fn unique_violation() -> BackendError {
    BackendError::with_status(409, "duplicate key value violates unique constraint")
        .with_code("23505")
}

#[derive(Default)]
struct ProfileState {
    rows: HashMap<UserId, Profile>,
    hidden_fetches: usize,
    fetch_failures: VecDeque<BackendError>,
    insert_failures: VecDeque<BackendError>,
    latency: Duration,
}

/// In-memory profile table enforcing primary-key uniqueness
#[derive(Default)]
pub struct MockProfileStore {
    state: Mutex<ProfileState>,
    fetch_calls: AtomicUsize,
    insert_calls: AtomicUsize,
    inserted: AtomicUsize,
}

impl MockProfileStore {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// Seed an existing row
    pub fn with_profile(self, profile: Profile) -> Self {
        lock(&self.state).rows.insert(profile.id.clone(), profile);
        self
    }

    /// Make the next `count` fetches report no row even if one exists
    pub fn hide_next_fetches(&self, count: usize) {
        lock(&self.state).hidden_fetches = count;
    }

    /// Queue a failure for the next fetch
    pub fn fail_next_fetch(&self, error: BackendError) {
        lock(&self.state).fetch_failures.push_back(error);
    }

    /// Queue a failure for the next insert
    pub fn fail_next_insert(&self, error: BackendError) {
        lock(&self.state).insert_failures.push_back(error);
    }

    /// Stored row for a user
    pub fn profile(&self, user_id: &UserId) -> Option<Profile> {
        lock(&self.state).rows.get(user_id).cloned()
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        lock(&self.state).rows.len()
    }

    /// True when no rows are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetch calls
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of insert calls, successful or not
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of rows actually created
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ProfileStore for MockProfileStore {
    async fn fetch_profile(&self, user_id: &UserId) -> BackendResult<Option<Profile>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let mut state = lock(&self.state);
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }
        if state.hidden_fetches > 0 {
            state.hidden_fetches -= 1;
            return Ok(None);
        }
        Ok(state.rows.get(user_id).cloned())
    }

    async fn insert_profile(&self, profile: &NewProfile) -> BackendResult<Profile> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let mut state = lock(&self.state);
        if let Some(error) = state.insert_failures.pop_front() {
            return Err(error);
        }
        if state.rows.contains_key(&profile.id) {
            return Err(unique_violation());
        }
        let row = profile.clone().into_profile();
        state.rows.insert(row.id.clone(), row.clone());
        self.inserted.fetch_add(1, Ordering::SeqCst);
        Ok(row)
    }
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Generates syntactically valid email addresses
pub fn valid_email() -> impl Strategy<Value = String> {
    ("[a-z][a-z0-9._]{0,15}", "[a-z][a-z0-9]{0,10}", "[a-z]{2,6}")
        .prop_map(|(local, domain, tld)| format!("{local}@{domain}.{tld}"))
}

/// Generates strings that are not email addresses
pub fn invalid_email() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("   ".to_string()),
        "[a-z]{1,12}",
        "[a-z]{1,8}@",
        "@[a-z]{1,8}\\.[a-z]{2,4}",
        "[a-z]{1,8}@[a-z]{1,8}",
        "[a-z]{1,5} [a-z]{1,5}@[a-z]{1,5}\\.com",
    ]
}

/// Generates passwords accepted at sign-up
pub fn valid_password() -> impl Strategy<Value = String> {
    "[A-Za-z0-9!@#$%^&*]{6,72}"
}

/// Generates passwords too short for sign-up
pub fn short_password() -> impl Strategy<Value = String> {
    "[A-Za-z0-9]{1,5}"
}

/// Generates opaque user ids
pub fn user_id() -> impl Strategy<Value = UserId> {
    "[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}".prop_map(UserId::new)
}
