//! Session orchestrator
//!
//! The only gateway to the identity backend. Each call is validated locally,
//! checked against the circuit breaker, deduplicated by fingerprint, and
//! finally run through the resilient executor. The outcome feeds the breaker
//! once per logical request, not once per retry attempt.

use crate::config::OrchestratorConfig;
use crate::fingerprint::Fingerprint;
use crate::inflight::InFlightRegistry;
use crate::store::SessionStore;
use crate::validation::{normalize_email, validate_credentials, validate_sign_up, validate_token};
use sessiond_error::SessionError;
use sessiond_resilience::{
    CircuitBreaker, CircuitMetrics, HealthSnapshot, ResilientExecutor, Subscription,
};
use sessiond_traits::{AuthSession, Credentials, IdentityBackend, SignUpRequest};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;

/// Wraps authentication calls with dedup, circuit breaking and health reporting
pub struct SessionOrchestrator {
    backend: Arc<dyn IdentityBackend>,
    executor: ResilientExecutor,
    breaker: Arc<CircuitBreaker>,
    store: SessionStore,
    config: OrchestratorConfig,
    sessions: InFlightRegistry<AuthSession>,
    sign_outs: InFlightRegistry<()>,
    connectivity: Mutex<Option<Subscription>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("circuit", &self.breaker.state())
            .field("pending", &self.pending_requests())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SessionOrchestrator {
    /// Create an orchestrator.
    ///
    /// Coming back online lets the breaker try the backend without waiting
    /// out the rest of its cooldown. When a health log interval is
    /// configured this must be called within a Tokio runtime.
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        executor: ResilientExecutor,
        store: SessionStore,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));

        let on_change = {
            let breaker = Arc::clone(&breaker);
            move |event: sessiond_resilience::ConnectivityEvent| {
                if event.online {
                    breaker.half_open_now();
                }
            }
        };
        let subscription = executor.connectivity().subscribe(on_change);

        let orchestrator = Arc::new(Self {
            backend,
            executor,
            breaker,
            store,
            sessions: InFlightRegistry::new(),
            sign_outs: InFlightRegistry::new(),
            connectivity: Mutex::new(Some(subscription)),
            health_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        if let Some(interval) = orchestrator.config.health_log_interval {
            let task = spawn_health_log(Arc::downgrade(&orchestrator), interval);
            *orchestrator
                .health_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(task);
        }

        orchestrator
    }

    /// Exchange credentials for a session
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<AuthSession, SessionError> {
        validate_credentials(credentials)?;

        let credentials = Credentials::new(
            normalize_email(&credentials.email),
            credentials.password.clone(),
        );
        let fingerprint = Fingerprint::builder("sign_in")
            .arg(&credentials.email)
            .secret(&credentials.password)
            .build();

        let backend = Arc::clone(&self.backend);
        self.dispatch("sign_in", &self.sessions, fingerprint, move || {
            let backend = Arc::clone(&backend);
            let credentials = credentials.clone();
            async move { backend.sign_in(&credentials).await.map_err(SessionError::from) }
        })
        .await
    }

    /// Create an account and return its first session
    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<AuthSession, SessionError> {
        validate_sign_up(request)?;

        let mut request = request.clone();
        request.credentials.email = normalize_email(&request.credentials.email);
        request.display_name = request.display_name.map(|name| name.trim().to_string());

        let fingerprint = Fingerprint::builder("sign_up")
            .arg(&request.credentials.email)
            .secret(&request.credentials.password)
            .secret(request.display_name.as_deref().unwrap_or_default())
            .build();

        let backend = Arc::clone(&self.backend);
        self.dispatch("sign_up", &self.sessions, fingerprint, move || {
            let backend = Arc::clone(&backend);
            let request = request.clone();
            async move { backend.sign_up(&request).await.map_err(SessionError::from) }
        })
        .await
    }

    /// Revoke the session owning `access_token` and clear the session record.
    ///
    /// The record is cleared even when revocation fails; the failure is
    /// still returned so the caller can report it.
    pub async fn sign_out(&self, access_token: &str) -> Result<(), SessionError> {
        let revoked = self.revoke(access_token).await;
        self.store.clear();
        if let Err(err) = &revoked {
            tracing::warn!(error = %err, "Remote sign-out failed; local session cleared");
        }
        revoked
    }

    async fn revoke(&self, access_token: &str) -> Result<(), SessionError> {
        validate_token("access_token", access_token)?;

        let fingerprint = Fingerprint::builder("sign_out").secret(access_token).build();
        let backend = Arc::clone(&self.backend);
        let token = access_token.to_string();

        self.dispatch("sign_out", &self.sign_outs, fingerprint, move || {
            let backend = Arc::clone(&backend);
            let token = token.clone();
            async move { backend.sign_out(&token).await.map_err(SessionError::from) }
        })
        .await
    }

    /// Exchange a refresh token for a fresh session
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, SessionError> {
        validate_token("refresh_token", refresh_token)?;

        let ticket = self.store.ticket();
        let fingerprint = Fingerprint::builder("refresh").secret(refresh_token).build();
        let backend = Arc::clone(&self.backend);
        let token = refresh_token.to_string();

        let session = self
            .dispatch("refresh_session", &self.sessions, fingerprint, move || {
                let backend = Arc::clone(&backend);
                let token = token.clone();
                async move { backend.refresh_session(&token).await.map_err(SessionError::from) }
            })
            .await?;

        if !self.store.set_session(ticket, session.clone()) {
            tracing::debug!("Session ended during refresh; rotated tokens not stored");
        }
        Ok(session)
    }

    /// Current health, computed from live state without I/O
    pub fn get_health_status(&self) -> HealthSnapshot {
        HealthSnapshot::compute(
            self.breaker.state(),
            self.executor.connectivity().is_online(),
            self.executor.active_operations(),
            self.pending_requests(),
        )
    }

    /// Circuit breaker metrics
    pub fn circuit_metrics(&self) -> CircuitMetrics {
        self.breaker.metrics()
    }

    /// The breaker guarding the identity backend
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Distinct deduplicated requests in flight
    pub fn pending_requests(&self) -> usize {
        self.sessions.len() + self.sign_outs.len()
    }

    /// True once [`cleanup`](Self::cleanup) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release subscriptions and timers. Idempotent.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscription = self
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);

        if let Some(task) = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        self.sessions.clear();
        self.sign_outs.clear();
        tracing::debug!("Session orchestrator cleaned up");
    }

    async fn dispatch<T, F, Fut>(
        &self,
        label: &'static str,
        registry: &InFlightRegistry<T>,
        fingerprint: Fingerprint,
        call: F,
    ) -> Result<T, SessionError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(SessionError::ServiceUnavailable(
                "session orchestrator is closed".into(),
            ));
        }

        if let Err(open) = self.breaker.check() {
            tracing::warn!(operation = label, circuit = %open.name, "Rejected by open circuit");
            return Err(open.into());
        }

        let executor = self.executor.clone();
        let breaker = Arc::clone(&self.breaker);
        let timeout = self.config.timeout.clone();
        let retry = self.config.retry.clone();

        let admission = registry.join_or_start(&fingerprint, move || {
            breaker.try_acquire()?;
            Ok(async move {
                let outcome = executor
                    .execute_resiliently(label, &timeout, &retry, call)
                    .await;
                breaker.record_outcome(&outcome);
                outcome
            })
        })?;

        if admission.joined() {
            tracing::debug!(operation = label, fingerprint = %fingerprint, "Deduplicated request");
        }
        admission.into_request().await
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn spawn_health_log(
    orchestrator: Weak<SessionOrchestrator>,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            let health = orchestrator.get_health_status();
            tracing::debug!(
                healthy = health.is_healthy,
                circuit_open = health.circuit_breaker_open,
                online = health.online,
                active = health.active_operations,
                pending = health.pending_requests,
                "Session layer health"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStatus;
    use sessiond_resilience::{CircuitBreakerConfig, ConnectivityMonitor, RetryPolicy};
    use sessiond_testing::{server_unavailable, MockIdentityBackend};
    use std::time::Duration;

    fn orchestrator_with(
        backend: Arc<MockIdentityBackend>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Arc<SessionOrchestrator> {
        let config = OrchestratorConfig::new()
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::no_retry())
            .with_circuit(
                CircuitBreakerConfig::new("identity")
                    .with_failure_threshold(5)
                    .with_reset_timeout(Duration::from_secs(30)),
            );
        SessionOrchestrator::new(
            backend,
            ResilientExecutor::new(monitor),
            SessionStore::new(),
            config,
        )
    }

    fn backend() -> Arc<MockIdentityBackend> {
        Arc::new(MockIdentityBackend::new().with_account("a@b.co", "secret1", "u1"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_success() {
        let backend = backend();
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(true));

        let session = orch
            .sign_in(&Credentials::new(" A@B.co ", "secret1"))
            .await
            .unwrap();
        assert_eq!(session.user.id.as_str(), "u1");
        assert_eq!(backend.sign_in_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_never_hits_network() {
        let backend = backend();
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(true));

        let err = orch.sign_in(&Credentials::new("", "")).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));
        let err = orch
            .sign_up(&SignUpRequest::new("a@b.co", "123"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_sign_ins_are_deduplicated() {
        let backend = Arc::new(
            MockIdentityBackend::new()
                .with_account("a@b.co", "secret1", "u1")
                .with_latency(Duration::from_millis(200)),
        );
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(true));

        let creds = Credentials::new("a@b.co", "secret1");
        let same_but_cased = Credentials::new("A@b.co", "secret1");
        let (a, b) = tokio::join!(orch.sign_in(&creds), orch.sign_in(&same_but_cased));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(backend.sign_in_calls(), 1);
        assert_eq!(orch.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_passwords_are_not_merged() {
        let backend = Arc::new(
            MockIdentityBackend::new()
                .with_account("a@b.co", "secret1", "u1")
                .with_latency(Duration::from_millis(200)),
        );
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(true));

        let good = Credentials::new("a@b.co", "secret1");
        let bad = Credentials::new("a@b.co", "wrong");
        let (a, b) = tokio::join!(orch.sign_in(&good), orch.sign_in(&bad));
        assert!(a.is_ok());
        assert!(matches!(b, Err(SessionError::Auth(_))));
        assert_eq!(backend.sign_in_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_five_failures() {
        let backend = backend();
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(true));
        backend.fail_next(5, server_unavailable());

        let creds = Credentials::new("a@b.co", "secret1");
        for _ in 0..5 {
            assert!(orch.sign_in(&creds).await.is_err());
        }
        assert_eq!(backend.sign_in_calls(), 5);
        assert!(orch.get_health_status().circuit_breaker_open);
        assert!(!orch.get_health_status().is_healthy);

        let err = orch.sign_in(&creds).await.unwrap_err();
        assert!(matches!(err, SessionError::CircuitOpen { .. }));
        assert!(err.to_string().starts_with("Service unavailable"));
        assert_eq!(backend.sign_in_calls(), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(orch.sign_in(&creds).await.is_ok());
        assert_eq!(backend.sign_in_calls(), 6);
        assert!(!orch.get_health_status().circuit_breaker_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failures_do_not_trip_circuit() {
        let backend = backend();
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(true));
        let bad = Credentials::new("a@b.co", "wrong");
        for _ in 0..6 {
            assert!(matches!(orch.sign_in(&bad).await, Err(SessionError::Auth(_))));
        }
        assert!(!orch.get_health_status().circuit_breaker_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_fails_fast() {
        let backend = backend();
        let orch = orchestrator_with(backend.clone(), ConnectivityMonitor::new(false));
        let err = orch
            .sign_in(&Credentials::new("a@b.co", "secret1"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Offline);
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_half_opens_circuit() {
        let backend = backend();
        let monitor = ConnectivityMonitor::new(true);
        let orch = orchestrator_with(backend.clone(), monitor.clone());
        orch.circuit_breaker().force_open();

        monitor.set_online(false);
        monitor.set_online(true);
        assert!(orch.sign_in(&Credentials::new("a@b.co", "secret1")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_clears_record() {
        let backend = backend();
        let store = SessionStore::new();
        let orch = SessionOrchestrator::new(
            backend.clone(),
            ResilientExecutor::new(ConnectivityMonitor::new(true)),
            store.clone(),
            OrchestratorConfig::new().with_retry(RetryPolicy::no_retry()),
        );

        let session = orch.sign_in(&Credentials::new("a@b.co", "secret1")).await.unwrap();
        store.mark_ready(store.ticket(), session.clone(), None);

        orch.sign_out(&session.access_token).await.unwrap();
        assert!(store.current().user_id.is_none());
        assert_eq!(backend.sign_out_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sign_out_still_clears_record() {
        let backend = backend();
        let store = SessionStore::new();
        let monitor = ConnectivityMonitor::new(true);
        let orch = SessionOrchestrator::new(
            backend.clone(),
            ResilientExecutor::new(Arc::clone(&monitor)),
            store.clone(),
            OrchestratorConfig::new().with_retry(RetryPolicy::no_retry()),
        );

        let session = orch.sign_in(&Credentials::new("a@b.co", "secret1")).await.unwrap();
        store.mark_ready(store.ticket(), session.clone(), None);
        monitor.set_online(false);

        let err = orch.sign_out(&session.access_token).await.unwrap_err();
        assert_eq!(err, SessionError::Offline);
        assert_eq!(store.status(), SessionStatus::NoSession);
        assert!(store.session().is_none());
        assert_eq!(backend.sign_out_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_updates_session() {
        let backend = backend();
        let store = SessionStore::new();
        let orch = SessionOrchestrator::new(
            backend.clone(),
            ResilientExecutor::new(ConnectivityMonitor::new(true)),
            store.clone(),
            OrchestratorConfig::new().with_retry(RetryPolicy::no_retry()),
        );
        let session = orch.sign_in(&Credentials::new("a@b.co", "secret1")).await.unwrap();

        let refreshed = orch.refresh_session(&session.refresh_token).await.unwrap();
        assert_eq!(refreshed.user.id, session.user.id);
        assert_eq!(store.session(), Some(refreshed));

        let err = orch.refresh_session("  ").await.unwrap_err();
        assert!(matches!(err, SessionError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_status_is_pure_read() {
        let orch = orchestrator_with(backend(), ConnectivityMonitor::new(true));
        let health = orch.get_health_status();
        assert!(health.is_healthy);
        assert_eq!(health.active_operations, 0);
        assert_eq!(health.pending_requests, 0);
        assert_eq!(orch.get_health_status().is_healthy, health.is_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_idempotent() {
        let monitor = ConnectivityMonitor::new(true);
        let orch = orchestrator_with(backend(), monitor.clone());
        assert_eq!(monitor.snapshot().subscribers, 1);

        orch.cleanup();
        orch.cleanup();
        assert!(orch.is_closed());
        assert_eq!(monitor.snapshot().subscribers, 0);

        let err = orch
            .sign_in(&Credentials::new("a@b.co", "secret1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ServiceUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_log_task_stops_on_cleanup() {
        let config = OrchestratorConfig::new().with_health_log_interval(Duration::from_secs(1));
        let orch = SessionOrchestrator::new(
            backend(),
            ResilientExecutor::new(ConnectivityMonitor::new(true)),
            SessionStore::new(),
            config,
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        orch.cleanup();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(orch.is_closed());
    }
}
