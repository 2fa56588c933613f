//! Application root
//!
//! [`Sessiond`] builds exactly one of each component and is the surface the
//! UI layer calls into.

use crate::config::{ConfigError, SessiondConfig};
use sessiond_auth::{
    AuthEvent, EventDisposition, FileKvStore, MemoryKvStore, ProfileProvisioner,
    ProvisionOutcome, RecoveryWriter, SessionInitializer, SessionOrchestrator, SessionRecord,
    SessionStatus, SessionStore,
};
use sessiond_error::{ErrorContext, SessionError};
use sessiond_resilience::{
    CircuitMetrics, ConnectivityEvent, ConnectivityMonitor, ConnectivitySnapshot, HealthSnapshot,
    ResilientExecutor, Subscription,
};
use sessiond_traits::{
    AuthSession, ConnectivitySource, Credentials, Identity, IdentityBackend, KeyValueStore,
    ProfileStore, SignUpRequest, UserId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// External systems the session layer talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Identity backend
    pub identity: Arc<dyn IdentityBackend>,
    /// Profile table
    pub profiles: Arc<dyn ProfileStore>,
    /// Runtime online/offline events; `None` leaves connectivity to
    /// [`Sessiond::set_online`]
    pub connectivity: Option<Arc<dyn ConnectivitySource>>,
    /// Recovery storage; `None` picks one from [`RecoveryConfig`](sessiond_auth::RecoveryConfig)
    pub storage: Option<Arc<dyn KeyValueStore>>,
}

impl Collaborators {
    /// Required collaborators only
    pub fn new(identity: Arc<dyn IdentityBackend>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            identity,
            profiles,
            connectivity: None,
            storage: None,
        }
    }

    /// Sets the connectivity source
    pub fn with_connectivity(mut self, source: Arc<dyn ConnectivitySource>) -> Self {
        self.connectivity = Some(source);
        self
    }

    /// Sets the recovery storage
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// The session layer
pub struct Sessiond {
    config: SessiondConfig,
    monitor: Arc<ConnectivityMonitor>,
    store: SessionStore,
    orchestrator: Arc<SessionOrchestrator>,
    provisioner: Arc<ProfileProvisioner>,
    initializer: Arc<SessionInitializer>,
    recovery: Arc<RecoveryWriter>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Sessiond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sessiond")
            .field("status", &self.store.status())
            .field("online", &self.monitor.is_online())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Sessiond {
    /// Build the session layer. Must be called within a Tokio runtime.
    pub fn new(config: SessiondConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let online = collaborators
            .connectivity
            .as_ref()
            .map_or(config.initially_online, |source| source.current());
        let monitor = ConnectivityMonitor::new(online);
        if let Some(source) = collaborators.connectivity {
            monitor.init(source);
        }

        let executor = ResilientExecutor::new(Arc::clone(&monitor));
        let store = SessionStore::new();

        let directory = &config.recovery.directory;
        let storage: Arc<dyn KeyValueStore> = match (collaborators.storage, directory) {
            (Some(storage), _) => storage,
            (None, Some(directory)) => Arc::new(FileKvStore::new(directory)),
            (None, None) => Arc::new(MemoryKvStore::new()),
        };
        let recovery = RecoveryWriter::new(storage, config.recovery.clone());

        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&collaborators.identity),
            executor.clone(),
            store.clone(),
            config.orchestrator.clone(),
        );
        let provisioner = Arc::new(ProfileProvisioner::new(
            collaborators.profiles,
            executor.clone(),
            config.provisioning.clone(),
        ));
        let initializer = Arc::new(
            SessionInitializer::new(
                collaborators.identity,
                executor,
                Arc::clone(&provisioner),
                store.clone(),
                config.initializer.clone(),
            )
            .with_recovery(Arc::clone(&recovery)),
        );

        tracing::debug!(online, "Session layer constructed");
        Ok(Self {
            config,
            monitor,
            store,
            orchestrator,
            provisioner,
            initializer,
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    /// Start the recovery writer and run startup. Returns the settled status.
    pub async fn start(&self) -> SessionStatus {
        self.recovery.start();
        self.initializer.initialize().await
    }

    /// Sign in and load the user's profile
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, SessionError> {
        let session = self.orchestrator.sign_in(credentials).await?;
        self.dispatch(AuthEvent::SignedIn(session.clone())).await;
        Ok(session)
    }

    /// Create an account, sign in and provision its profile
    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<AuthSession, SessionError> {
        let session = self.orchestrator.sign_up(request).await?;
        self.dispatch(AuthEvent::SignedIn(session.clone())).await;
        Ok(session)
    }

    /// Sign out the current user.
    ///
    /// Local state and the recovery snapshot are cleared even when the
    /// backend call fails; the error is still returned.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let outcome = match self.store.session() {
            Some(session) => self.orchestrator.sign_out(&session.access_token).await,
            None => Ok(()),
        };
        self.store.clear();
        self.recovery.record_session(None);
        outcome
    }

    /// Rotate the current session's tokens
    pub async fn refresh_session(&self) -> Result<AuthSession, SessionError> {
        let session = self.store.session().context("no active session to refresh")?;
        self.orchestrator.refresh_session(&session.refresh_token).await
    }

    /// Make sure `user_id` has a profile row.
    ///
    /// For the signed-in user the created or fetched profile is stored on
    /// the session record.
    pub async fn ensure_profile(&self, user_id: &UserId) -> Result<ProvisionOutcome, SessionError> {
        let current = self.store.session().filter(|session| &session.user.id == user_id);
        let identity = current
            .as_ref()
            .map_or_else(|| Identity::new(user_id.clone()), |session| session.user.clone());

        let ticket = self.store.ticket();
        let outcome = self.provisioner.ensure_profile(&identity).await?;
        if let (Some(session), Some(profile)) = (current, outcome.profile()) {
            if !self.store.mark_ready(ticket, session, Some(profile.clone())) {
                tracing::debug!(user_id = %user_id, "Session changed during provisioning");
            }
        }
        Ok(outcome)
    }

    /// Apply a notification pushed by the identity backend
    pub async fn handle_auth_event(&self, event: AuthEvent) -> EventDisposition {
        self.initializer.handle_auth_event(event).await
    }

    /// Current health, without I/O
    pub fn health(&self) -> HealthSnapshot {
        self.orchestrator.get_health_status()
    }

    /// Circuit breaker metrics
    pub fn circuit_metrics(&self) -> CircuitMetrics {
        self.orchestrator.circuit_metrics()
    }

    /// Observe connectivity transitions
    pub fn subscribe_connectivity<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityEvent) + Send + Sync + 'static,
    {
        self.monitor.subscribe(callback)
    }

    /// Connectivity state
    pub fn connectivity(&self) -> ConnectivitySnapshot {
        self.monitor.snapshot()
    }

    /// Push a connectivity value from the host
    pub fn set_online(&self, online: bool) -> bool {
        self.monitor.set_online(online)
    }

    /// Current session record
    pub fn session(&self) -> SessionRecord {
        self.store.current()
    }

    /// Observe session record changes
    pub fn watch_session(&self) -> watch::Receiver<SessionRecord> {
        self.store.subscribe()
    }

    /// Add a message to the recovery snapshot
    pub fn record_message(&self, message: impl Into<String>) {
        self.recovery.record_message(message);
    }

    /// Write the recovery snapshot now
    pub async fn flush_recovery(&self) -> Result<bool, SessionError> {
        self.recovery.flush().await
    }

    /// The active configuration
    pub fn config(&self) -> &SessiondConfig {
        &self.config
    }

    /// True once [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop timers and subscriptions. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.orchestrator.cleanup();
        self.recovery.stop();
        self.monitor.close();
        tracing::info!("Session layer closed");
    }

    async fn dispatch(&self, event: AuthEvent) {
        if let AuthEvent::SignedIn(session) = &event {
            self.recovery.record_session(Some(session.user.clone()));
        }
        if self.initializer.handle_auth_event(event).await == EventDisposition::Ignored {
            tracing::debug!("Startup still running; it will settle the session record");
        }
    }
}

impl Drop for Sessiond {
    fn drop(&mut self) {
        self.close();
    }
}
