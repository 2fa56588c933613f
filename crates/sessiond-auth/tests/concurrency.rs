//! Interleaving scenarios across orchestrator, provisioner and initializer

use sessiond_auth::{
    AuthEvent, EventDisposition, InitializerConfig, OrchestratorConfig, ProfileProvisioner,
    ProvisionOutcome, ProvisioningConfig, SessionInitializer, SessionOrchestrator, SessionStatus,
    SessionStore,
};
use sessiond_error::SessionError;
use sessiond_resilience::{
    CircuitBreakerConfig, CircuitState, ConnectivityMonitor, ResilientExecutor, RetryPolicy,
};
use sessiond_testing::{server_unavailable, session_for, MockIdentityBackend, MockProfileStore};
use sessiond_traits::{Credentials, Identity};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn orchestrator(
    backend: Arc<MockIdentityBackend>,
    monitor: Arc<ConnectivityMonitor>,
    retry: RetryPolicy,
) -> Arc<SessionOrchestrator> {
    SessionOrchestrator::new(
        backend,
        ResilientExecutor::new(monitor),
        SessionStore::new(),
        OrchestratorConfig::new()
            .with_timeout(Duration::from_secs(2))
            .with_retry(retry)
            .with_circuit(
                CircuitBreakerConfig::new("identity").with_reset_timeout(Duration::from_secs(30)),
            ),
    )
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_of_identical_sign_ins_makes_one_call() {
    let backend = Arc::new(
        MockIdentityBackend::new()
            .with_account("jane@example.com", "secret1", "u1")
            .with_latency(Duration::from_millis(300)),
    );
    let orch = orchestrator(
        backend.clone(),
        ConnectivityMonitor::new(true),
        RetryPolicy::no_retry(),
    );

    let mut handles = Vec::new();
    for _ in 0..10 {
        let orch = Arc::clone(&orch);
        handles.push(tokio::spawn(async move {
            orch.sign_in(&Credentials::new("jane@example.com", "secret1")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(backend.sign_in_calls(), 1);
    assert_eq!(orch.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_completed_request_is_not_reused() {
    let backend = Arc::new(MockIdentityBackend::new().with_account("a@b.co", "secret1", "u1"));
    let orch = orchestrator(
        backend.clone(),
        ConnectivityMonitor::new(true),
        RetryPolicy::no_retry(),
    );
    let creds = Credentials::new("a@b.co", "secret1");

    orch.sign_in(&creds).await.unwrap();
    orch.sign_in(&creds).await.unwrap();
    assert_eq!(backend.sign_in_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_caller_does_not_leak_request() {
    let backend = Arc::new(
        MockIdentityBackend::new()
            .with_account("a@b.co", "secret1", "u1")
            .with_latency(Duration::from_millis(200)),
    );
    let orch = orchestrator(
        backend.clone(),
        ConnectivityMonitor::new(true),
        RetryPolicy::no_retry(),
    );
    let creds = Credentials::new("a@b.co", "secret1");

    let abandoned = tokio::time::timeout(Duration::from_millis(10), orch.sign_in(&creds)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(60)).await;
    let health = orch.get_health_status();
    assert_eq!(health.pending_requests, 0);
    assert_eq!(health.active_operations, 0);
    assert_eq!(backend.sign_in_calls(), 1);

    orch.sign_in(&creds).await.unwrap();
    assert_eq!(backend.sign_in_calls(), 2);
}

// ============================================================================
// Retry and Circuit Breaking
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_silently() {
    let backend = Arc::new(MockIdentityBackend::new().with_account("a@b.co", "secret1", "u1"));
    backend.fail_next(2, server_unavailable());
    let orch = orchestrator(
        backend.clone(),
        ConnectivityMonitor::new(true),
        RetryPolicy::default(),
    );

    let started = Instant::now();
    let session = orch.sign_in(&Credentials::new("a@b.co", "secret1")).await.unwrap();

    assert_eq!(session.user.id.as_str(), "u1");
    assert_eq!(backend.sign_in_calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(orch.circuit_metrics().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_auth_errors_are_not_retried() {
    let backend = Arc::new(MockIdentityBackend::new().with_account("a@b.co", "secret1", "u1"));
    let orch = orchestrator(
        backend.clone(),
        ConnectivityMonitor::new(true),
        RetryPolicy::default(),
    );

    let err = orch.sign_in(&Credentials::new("a@b.co", "nope")).await.unwrap_err();
    assert!(matches!(err, SessionError::Auth(_)));
    assert!(!err.can_retry());
    assert_eq!(backend.sign_in_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_one_trial_and_joins_identical_calls() {
    let backend = Arc::new(
        MockIdentityBackend::new()
            .with_account("a@b.co", "secret1", "u1")
            .with_account("c@d.co", "secret2", "u2")
            .with_latency(Duration::from_millis(100)),
    );
    backend.fail_next(5, server_unavailable());
    let orch = orchestrator(
        backend.clone(),
        ConnectivityMonitor::new(true),
        RetryPolicy::no_retry(),
    );

    let jane = Credentials::new("a@b.co", "secret1");
    for _ in 0..5 {
        assert!(orch.sign_in(&jane).await.is_err());
    }
    assert_eq!(orch.circuit_metrics().state, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;

    let other = Credentials::new("c@d.co", "secret2");
    let (trial, joined, rejected) =
        tokio::join!(orch.sign_in(&jane), orch.sign_in(&jane), orch.sign_in(&other));

    assert!(trial.is_ok());
    assert!(joined.is_ok());
    assert!(matches!(rejected, Err(SessionError::CircuitOpen { .. })));
    assert_eq!(backend.sign_in_calls(), 6);
    assert_eq!(orch.circuit_metrics().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_offline_calls_do_not_trip_circuit() {
    let backend = Arc::new(MockIdentityBackend::new().with_account("a@b.co", "secret1", "u1"));
    let monitor = ConnectivityMonitor::new(false);
    let orch = orchestrator(backend.clone(), monitor.clone(), RetryPolicy::no_retry());
    let creds = Credentials::new("a@b.co", "secret1");

    for _ in 0..10 {
        assert_eq!(orch.sign_in(&creds).await.unwrap_err(), SessionError::Offline);
    }
    assert_eq!(orch.circuit_metrics().state, CircuitState::Closed);
    assert!(!orch.get_health_status().online);

    monitor.set_online(true);
    assert!(orch.sign_in(&creds).await.is_ok());
    assert!(orch.get_health_status().is_healthy);
}

// ============================================================================
// Provisioning Races
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_startup_and_sign_in_event_provision_once() {
    let backend = Arc::new(
        MockIdentityBackend::new().with_current_session(session_for("u1", "jane@example.com")),
    );
    let profiles = Arc::new(MockProfileStore::new().with_latency(Duration::from_millis(50)));
    let provisioner = Arc::new(ProfileProvisioner::new(
        profiles.clone(),
        ResilientExecutor::new(ConnectivityMonitor::new(true)),
        ProvisioningConfig::default(),
    ));
    let store = SessionStore::new();
    let initializer = SessionInitializer::new(
        backend,
        ResilientExecutor::new(ConnectivityMonitor::new(true)),
        Arc::clone(&provisioner),
        store.clone(),
        InitializerConfig::development(),
    );

    let identity = Identity::new("u1").with_email("jane@example.com");
    let (status, direct, event) = tokio::join!(
        initializer.initialize(),
        provisioner.ensure_profile(&identity),
        initializer.handle_auth_event(AuthEvent::SignedIn(session_for("u1", "jane@example.com")))
    );

    assert_eq!(status, SessionStatus::Ready);
    assert!(direct.is_ok());
    assert_eq!(event, EventDisposition::Ignored);
    assert_eq!(profiles.inserted(), 1);
    assert_eq!(profiles.len(), 1);
    assert!(provisioner.lock().is_empty());

    let again = provisioner.ensure_profile(&identity).await.unwrap();
    assert!(matches!(again, ProvisionOutcome::Existing(_)));
    assert!(store.current().is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_many_concurrent_provisioners_create_one_row() {
    let profiles = Arc::new(MockProfileStore::new().with_latency(Duration::from_millis(20)));
    let provisioner = Arc::new(ProfileProvisioner::new(
        profiles.clone(),
        ResilientExecutor::new(ConnectivityMonitor::new(true)),
        ProvisioningConfig::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provisioner = Arc::clone(&provisioner);
        handles.push(tokio::spawn(async move {
            provisioner.ensure_profile(&Identity::new("u1")).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ProvisionOutcome::Created(_) => created += 1,
            ProvisionOutcome::InProgress | ProvisionOutcome::Existing(_) => {}
            ProvisionOutcome::Recovered(_) => panic!("no conflict expected"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(profiles.insert_calls(), 1);
}
