//! The session record and its single owner
//!
//! Every mutation is one synchronous `send_modify`, so readers never see a
//! half-applied update and observers are woken once per change.

use serde::Serialize;
use sessiond_error::UserFacingError;
use sessiond_traits::{AuthSession, Profile, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of the session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Startup or a sign-in is being processed
    Initializing,
    /// Signed in with a provisioned profile
    Ready,
    /// Nobody is signed in
    NoSession,
    /// Startup failed
    Error,
}

/// Current session state shown to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Signed-in user
    pub user_id: Option<UserId>,
    /// Their profile, once provisioned
    pub profile: Option<Profile>,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Token restored from the recovery snapshot
    pub recovery_token: Option<String>,
    /// The session itself; never serialized
    #[serde(skip)]
    pub session: Option<AuthSession>,
    /// Why the last transition to `Error` happened
    pub last_error: Option<UserFacingError>,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            user_id: None,
            profile: None,
            status: SessionStatus::Initializing,
            recovery_token: None,
            session: None,
            last_error: None,
        }
    }
}

impl SessionRecord {
    /// True when signed in with a profile
    pub fn is_ready(&self) -> bool {
        self.status == SessionStatus::Ready
    }
}

/// Identifies the sign-in cycle a deferred write belongs to.
///
/// Every sign-in, sign-out and fallback to `NoSession` starts a new cycle.
/// Writes carrying a ticket from an earlier cycle are discarded, so work that
/// finishes after the user signed out cannot bring the session back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket(u64);

/// Single owner of the [`SessionRecord`]
#[derive(Debug, Clone)]
pub struct SessionStore {
    sender: Arc<watch::Sender<SessionRecord>>,
    epoch: Arc<AtomicU64>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create a store in the `Initializing` state
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SessionRecord::default());
        Self {
            sender: Arc::new(sender),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Copy of the current record
    pub fn current(&self) -> SessionRecord {
        self.sender.borrow().clone()
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.sender.borrow().status
    }

    /// Current session, if any
    pub fn session(&self) -> Option<AuthSession> {
        self.sender.borrow().session.clone()
    }

    /// Observe changes
    pub fn subscribe(&self) -> watch::Receiver<SessionRecord> {
        self.sender.subscribe()
    }

    /// Ticket for the current cycle, for writes issued after an await
    pub fn ticket(&self) -> SessionTicket {
        SessionTicket(self.epoch.load(Ordering::SeqCst))
    }

    /// True while no sign-in or sign-out happened since `ticket` was issued
    pub fn is_current(&self, ticket: SessionTicket) -> bool {
        self.ticket() == ticket
    }

    /// Start a new cycle in `Initializing`, optionally for a known session
    pub fn begin(&self, session: Option<AuthSession>) -> SessionTicket {
        let mut ticket = self.ticket();
        self.apply(None, |record| {
            ticket = self.advance();
            if let Some(session) = session {
                if record.user_id.as_ref() != Some(&session.user.id) {
                    record.profile = None;
                }
                record.user_id = Some(session.user.id.clone());
                record.session = Some(session);
            }
            record.status = SessionStatus::Initializing;
            record.last_error = None;
        });
        ticket
    }

    /// Store rotated tokens without changing status.
    ///
    /// Returns false if the cycle ended while the tokens were being fetched.
    pub fn set_session(&self, ticket: SessionTicket, session: AuthSession) -> bool {
        self.apply(Some(ticket), |record| {
            if record.user_id.as_ref() != Some(&session.user.id) {
                record.profile = None;
            }
            record.user_id = Some(session.user.id.clone());
            record.session = Some(session);
        })
    }

    /// Enter `Ready`, unless the cycle of `ticket` has ended.
    ///
    /// A `None` profile keeps whatever profile is already stored for the
    /// same user.
    pub fn mark_ready(
        &self,
        ticket: SessionTicket,
        session: AuthSession,
        profile: Option<Profile>,
    ) -> bool {
        self.apply(Some(ticket), |record| {
            let same_user = record.user_id.as_ref() == Some(&session.user.id);
            record.profile = match profile {
                Some(profile) => Some(profile),
                None if same_user => record.profile.take(),
                None => None,
            };
            record.user_id = Some(session.user.id.clone());
            record.session = Some(session);
            record.status = SessionStatus::Ready;
            record.last_error = None;
        })
    }

    /// Enter `NoSession`, dropping user data but keeping the recovery token
    pub fn mark_no_session(&self) {
        self.apply(None, |record| {
            self.advance();
            record.user_id = None;
            record.profile = None;
            record.session = None;
            record.status = SessionStatus::NoSession;
            record.last_error = None;
        });
    }

    /// Enter `Error`, unless the cycle of `ticket` has ended
    pub fn mark_error(&self, ticket: SessionTicket, error: UserFacingError) -> bool {
        self.apply(Some(ticket), |record| {
            record.status = SessionStatus::Error;
            record.last_error = Some(error);
        })
    }

    /// Discard the record entirely (sign-out)
    pub fn clear(&self) {
        self.apply(None, |record| {
            self.advance();
            *record = SessionRecord {
                status: SessionStatus::NoSession,
                ..SessionRecord::default()
            };
        });
    }

    /// Record the token restored from a recovery snapshot
    pub fn set_recovery_token(&self, token: Option<String>) {
        self.apply(None, |record| record.recovery_token = token);
    }

    fn advance(&self) -> SessionTicket {
        SessionTicket(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The ticket check and the mutation run under the channel's write lock,
    /// and the epoch only moves under that lock.
    fn apply(
        &self,
        ticket: Option<SessionTicket>,
        mutate: impl FnOnce(&mut SessionRecord),
    ) -> bool {
        let mut transition = None;
        let applied = self.sender.send_if_modified(|record| {
            if ticket.is_some_and(|ticket| !self.is_current(ticket)) {
                return false;
            }
            let before = record.status;
            mutate(record);
            if before != record.status {
                transition = Some((before, record.status));
            }
            true
        });

        if let Some((from, to)) = transition {
            tracing::info!(?from, ?to, "Session status changed");
        }
        if !applied {
            tracing::debug!(?ticket, "Discarding write from an ended session cycle");
        }
        applied
    }
}
