//! Startup sequencing
//!
//! Looks up the current session, provisions its profile and settles the
//! [`SessionStore`] in a terminal status. Two nested deadlines bound the
//! work: a safety scope that always ends startup (falling back to
//! `NoSession`), and an operation scope around the session lookup.
//!
//! Auth events that arrive before startup completes are ignored so only one
//! writer touches the record at a time.

use crate::config::InitializerConfig;
use crate::provisioner::{ProfileProvisioner, ProvisionOutcome};
use crate::recovery::RecoveryWriter;
use crate::store::{SessionStatus, SessionStore, SessionTicket};
use sessiond_error::SessionError;
use sessiond_resilience::{Deadline, DeadlineError, ResilientExecutor, TimeoutOptions};
use sessiond_traits::{AuthSession, IdentityBackend};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Notification pushed by the identity backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A user signed in
    SignedIn(AuthSession),
    /// The user signed out
    SignedOut,
    /// Tokens were rotated for the same user
    TokenRefreshed(AuthSession),
}

/// What [`SessionInitializer::handle_auth_event`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The record was updated
    Applied,
    /// Startup was still running; the event was dropped
    Ignored,
}

/// Startup progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    /// Not started
    Idle,
    /// Startup is running
    Running,
    /// Startup finished, events are processed
    Complete,
}

/// Moves the phase to `Complete` however startup ends, including
/// cancellation.
struct PhaseGuard<'a> {
    phase: &'a Mutex<InitPhase>,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = InitPhase::Complete;
    }
}

/// Drives startup and applies later auth events
pub struct SessionInitializer {
    backend: Arc<dyn IdentityBackend>,
    executor: ResilientExecutor,
    provisioner: Arc<ProfileProvisioner>,
    store: SessionStore,
    recovery: Option<Arc<RecoveryWriter>>,
    config: InitializerConfig,
    phase: Mutex<InitPhase>,
}

impl std::fmt::Debug for SessionInitializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInitializer")
            .field("phase", &self.phase())
            .field("config", &self.config)
            .finish()
    }
}

impl SessionInitializer {
    /// Create an initializer.
    ///
    /// The startup session lookup runs through `executor`, so it fails fast
    /// while offline and is retried under `config.retry`.
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        executor: ResilientExecutor,
        provisioner: Arc<ProfileProvisioner>,
        store: SessionStore,
        config: InitializerConfig,
    ) -> Self {
        Self {
            backend,
            executor,
            provisioner,
            store,
            recovery: None,
            config,
            phase: Mutex::new(InitPhase::Idle),
        }
    }

    /// Restore and keep a recovery snapshot
    pub fn with_recovery(mut self, recovery: Arc<RecoveryWriter>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Current phase
    pub fn phase(&self) -> InitPhase {
        *self.lock_phase()
    }

    /// True once startup has finished
    pub fn is_complete(&self) -> bool {
        self.phase() == InitPhase::Complete
    }

    /// Run startup once and return the status it settled on.
    ///
    /// Later calls return the current status without touching the backend.
    pub async fn initialize(&self) -> SessionStatus {
        {
            let mut phase = self.lock_phase();
            if *phase != InitPhase::Idle {
                tracing::debug!(phase = ?*phase, "Session initialization already started");
                return self.store.status();
            }
            *phase = InitPhase::Running;
        }
        let _complete = PhaseGuard { phase: &self.phase };

        let safety = Deadline::new(self.config.safety_timeout);
        let status = safety
            .execute_or(self.run(&safety), || {
                tracing::warn!(
                    timeout_ms = self.config.safety_timeout.as_millis() as u64,
                    "Session initialization hit safety timeout"
                );
                self.store.mark_no_session();
                SessionStatus::NoSession
            })
            .await;

        tracing::info!(
            ?status,
            elapsed_ms = safety.elapsed().as_millis() as u64,
            "Session initialized"
        );
        status
    }

    /// Apply a backend notification, unless startup is still running
    pub async fn handle_auth_event(&self, event: AuthEvent) -> EventDisposition {
        if !self.is_complete() {
            tracing::debug!(?event, "Ignoring auth event during initialization");
            return EventDisposition::Ignored;
        }

        match event {
            AuthEvent::SignedOut => {
                self.store.clear();
                if let Some(recovery) = &self.recovery {
                    recovery.record_session(None);
                }
            }
            AuthEvent::TokenRefreshed(session) => {
                self.store.set_session(self.store.ticket(), session);
            }
            AuthEvent::SignedIn(session) => {
                let ticket = self.store.begin(Some(session.clone()));
                self.settle(ticket, session).await;
            }
        }
        EventDisposition::Applied
    }

    async fn run(&self, safety: &Deadline) -> SessionStatus {
        let ticket = self.store.ticket();
        self.restore_recovery().await;

        let lookup = safety.child(self.config.operation_timeout);
        let attempt = TimeoutOptions::new(lookup.timeout());
        let backend = &self.backend;
        let current = lookup
            .execute(self.executor.execute_resiliently(
                "current_session",
                &attempt,
                &self.config.retry,
                || async move { backend.current_session().await.map_err(SessionError::from) },
            ))
            .await;

        match current {
            Ok(None) => {
                self.store.mark_no_session();
                SessionStatus::NoSession
            }
            Ok(Some(session)) => {
                let ticket = self.store.begin(Some(session.clone()));
                self.settle(ticket, session).await
            }
            Err(DeadlineError::Expired) if safety.is_expired() => {
                self.store.mark_no_session();
                SessionStatus::NoSession
            }
            Err(DeadlineError::Expired) => {
                let err = SessionError::Timeout {
                    duration: lookup.timeout(),
                };
                tracing::warn!(error = %err, "Session lookup timed out");
                self.fail(ticket, err)
            }
            Err(DeadlineError::Inner(err)) => {
                tracing::warn!(error = %err, "Session lookup failed");
                self.fail(ticket, err)
            }
        }
    }

    /// Provision the profile for `session` and enter `Ready`.
    ///
    /// If the cycle of `ticket` ended meanwhile (sign-out, newer sign-in)
    /// the record is left alone and its current status is returned.
    async fn settle(&self, ticket: SessionTicket, session: AuthSession) -> SessionStatus {
        let user = session.user.clone();
        match self.provisioner.ensure_profile(&user).await {
            Ok(outcome) => {
                if outcome == ProvisionOutcome::InProgress {
                    tracing::debug!(
                        user_id = %user.id,
                        "Profile owned by concurrent provisioning"
                    );
                }
                if !self.store.mark_ready(ticket, session, outcome.into_profile()) {
                    tracing::debug!(
                        user_id = %user.id,
                        "Session ended before provisioning settled"
                    );
                    return self.store.status();
                }
                if let Some(recovery) = &self.recovery {
                    recovery.record_session(Some(user));
                }
                SessionStatus::Ready
            }
            Err(err) => {
                tracing::warn!(user_id = %user.id, error = %err, "Profile provisioning failed");
                self.fail(ticket, err)
            }
        }
    }

    fn fail(&self, ticket: SessionTicket, err: SessionError) -> SessionStatus {
        if self.store.mark_error(ticket, err.to_user_facing()) {
            SessionStatus::Error
        } else {
            self.store.status()
        }
    }

    async fn restore_recovery(&self) {
        let Some(recovery) = &self.recovery else {
            return;
        };
        match recovery.load().await {
            Ok(Some(snapshot)) => self.store.set_recovery_token(Some(snapshot.token)),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "Failed to read recovery snapshot"),
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, InitPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
