//! Recovery snapshots
//!
//! A small JSON document (token, last known user, the last few messages)
//! written to a [`KeyValueStore`] on a fixed interval and read once at
//! startup.

use crate::config::RecoveryConfig;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sessiond_error::SessionError;
use sessiond_traits::{Identity, KeyValueStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use tokio::task::JoinHandle;

/// Persisted recovery state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    /// Stable token identifying this installation's recovery data
    pub token: String,
    /// User of the last known session
    pub last_session: Option<Identity>,
    /// Most recent messages, oldest first
    pub recent_messages: Vec<String>,
    /// When the snapshot was written
    pub saved_at: SystemTime,
}

#[derive(Debug)]
struct WriterState {
    token: String,
    last_session: Option<Identity>,
    messages: VecDeque<String>,
    dirty: bool,
    loaded: bool,
}

/// Collects recovery state and persists it periodically
pub struct RecoveryWriter {
    store: Arc<dyn KeyValueStore>,
    config: RecoveryConfig,
    state: Mutex<WriterState>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for RecoveryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryWriter")
            .field("key", &self.config.key)
            .field("enabled", &self.config.enabled)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl RecoveryWriter {
    /// Create a writer; nothing is persisted until [`start`](Self::start)
    /// or [`flush`](Self::flush)
    pub fn new(store: Arc<dyn KeyValueStore>, config: RecoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: Mutex::new(WriterState {
                token: generate_token(),
                last_session: None,
                messages: VecDeque::with_capacity(config.max_messages),
                dirty: false,
                loaded: false,
            }),
            config,
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Read the stored snapshot and adopt its contents.
    ///
    /// Only the first call touches storage; later calls return `None`.
    /// A corrupt snapshot is logged and treated as absent.
    pub async fn load(&self) -> Result<Option<RecoverySnapshot>, SessionError> {
        {
            let mut state = self.lock();
            if state.loaded {
                return Ok(None);
            }
            state.loaded = true;
        }
        if !self.config.enabled {
            return Ok(None);
        }

        let Some(raw) = self.store.get(&self.config.key).await? else {
            return Ok(None);
        };
        let snapshot: RecoverySnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    key = %self.config.key,
                    error = %err,
                    "Discarding corrupt recovery snapshot"
                );
                return Ok(None);
            }
        };

        let mut state = self.lock();
        state.token = snapshot.token.clone();
        state.last_session = snapshot.last_session.clone();
        state.messages = snapshot.recent_messages.iter().cloned().collect();
        while state.messages.len() > self.config.max_messages {
            state.messages.pop_front();
        }
        tracing::info!(
            messages = state.messages.len(),
            has_session = state.last_session.is_some(),
            "Recovery snapshot restored"
        );
        Ok(Some(snapshot))
    }

    /// Remember a message, dropping the oldest beyond the cap
    pub fn record_message(&self, message: impl Into<String>) {
        if self.config.max_messages == 0 {
            return;
        }
        let mut state = self.lock();
        if state.messages.len() == self.config.max_messages {
            state.messages.pop_front();
        }
        state.messages.push_back(message.into());
        state.dirty = true;
    }

    /// Remember the current user, or forget it with `None`
    pub fn record_session(&self, identity: Option<Identity>) {
        let mut state = self.lock();
        if state.last_session != identity {
            state.last_session = identity;
            state.dirty = true;
        }
    }

    /// The recovery token
    pub fn token(&self) -> String {
        self.lock().token.clone()
    }

    /// Current state as a snapshot
    pub fn snapshot(&self) -> RecoverySnapshot {
        let state = self.lock();
        RecoverySnapshot {
            token: state.token.clone(),
            last_session: state.last_session.clone(),
            recent_messages: state.messages.iter().cloned().collect(),
            saved_at: SystemTime::now(),
        }
    }

    /// Write a snapshot now if anything changed since the last write
    pub async fn flush(&self) -> Result<bool, SessionError> {
        if !self.config.enabled {
            return Ok(false);
        }
        let snapshot = {
            let mut state = self.lock();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            RecoverySnapshot {
                token: state.token.clone(),
                last_session: state.last_session.clone(),
                recent_messages: state.messages.iter().cloned().collect(),
                saved_at: SystemTime::now(),
            }
        };

        let json = serde_json::to_string(&snapshot)
            .map_err(|err| SessionError::Storage(format!("failed to encode snapshot: {err}")))?;
        if let Err(err) = self.store.put(&self.config.key, json).await {
            self.lock().dirty = true;
            return Err(err);
        }
        tracing::trace!(key = %self.config.key, "Recovery snapshot written");
        Ok(true)
    }

    /// Start the periodic writer. Idempotent; requires a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        *task = Some(spawn_writer(Arc::downgrade(self), self.config.interval));
    }

    /// Stop the periodic writer. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// True while the periodic writer runs
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RecoveryWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_writer(writer: Weak<RecoveryWriter>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(writer) = writer.upgrade() else {
                break;
            };
            if let Err(err) = writer.flush().await {
                tracing::warn!(error = %err, "Failed to write recovery snapshot");
            }
        }
    })
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
