//! Connectivity monitoring with subscriber fan-out
//!
//! Tracks whether the device is online and notifies subscribers exactly once
//! per genuine transition. Repeated identical values are swallowed.

use sessiond_traits::ConnectivitySource;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Callback invoked on every online/offline transition
pub type ConnectivityCallback = Arc<dyn Fn(ConnectivityEvent) + Send + Sync>;

/// A single online/offline transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    /// New connectivity value
    pub online: bool,
    /// When the transition was observed
    pub changed_at: Instant,
}

/// Point-in-time view of the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    /// Current connectivity
    pub online: bool,
    /// Time of the last genuine transition (or construction)
    pub last_changed: Instant,
    /// Number of live subscribers
    pub subscribers: usize,
}

struct MonitorState {
    online: bool,
    last_changed: Instant,
    subscribers: Vec<(u64, ConnectivityCallback)>,
    next_id: u64,
}

/// Online/offline tracker shared by the whole process.
///
/// Constructed once by the application root and handed to dependents as an
/// `Arc`.
pub struct ConnectivityMonitor {
    state: Mutex<MonitorState>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ConnectivityMonitor")
            .field("online", &snapshot.online)
            .field("subscribers", &snapshot.subscribers)
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial connectivity value
    pub fn new(initially_online: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MonitorState {
                online: initially_online,
                last_changed: Instant::now(),
                subscribers: Vec::new(),
                next_id: 0,
            }),
            forwarder: Mutex::new(None),
        })
    }

    /// Attach the runtime's event source.
    ///
    /// Idempotent: while a forwarder is running, further calls do nothing, so
    /// no duplicate hook is ever registered. Must be called within a Tokio
    /// runtime.
    pub fn init(self: &Arc<Self>, source: Arc<dyn ConnectivitySource>) {
        let mut forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if forwarder.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Connectivity monitor already initialized");
            return;
        }

        let mut updates = source.watch();
        self.set_online(source.current());

        let monitor: Weak<Self> = Arc::downgrade(self);
        *forwarder = Some(tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let online = *updates.borrow_and_update();
                match monitor.upgrade() {
                    Some(monitor) => {
                        monitor.set_online(online);
                    }
                    None => break,
                }
            }
        }));
    }

    /// Current connectivity
    pub fn is_online(&self) -> bool {
        self.lock_state().online
    }

    /// Current state
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        let state = self.lock_state();
        ConnectivitySnapshot {
            online: state.online,
            last_changed: state.last_changed,
            subscribers: state.subscribers.len(),
        }
    }

    /// Register a callback for transitions.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped or disposed.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(ConnectivityEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, Arc::new(callback)));

        Subscription {
            monitor: Arc::downgrade(self),
            id,
        }
    }

    /// Record a connectivity value; returns true if it was a transition.
    ///
    /// Subscribers are invoked outside the lock on a snapshot copy of the
    /// subscriber list. A panicking subscriber is logged and skipped.
    pub fn set_online(&self, online: bool) -> bool {
        let (event, subscribers) = {
            let mut state = self.lock_state();
            if state.online == online {
                return false;
            }
            state.online = online;
            state.last_changed = Instant::now();
            let event = ConnectivityEvent {
                online,
                changed_at: state.last_changed,
            };
            let subscribers: Vec<ConnectivityCallback> = state
                .subscribers
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            (event, subscribers)
        };

        if online {
            tracing::info!(subscribers = subscribers.len(), "Connectivity restored");
        } else {
            tracing::warn!(subscribers = subscribers.len(), "Connectivity lost");
        }

        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(online, "Connectivity subscriber panicked");
            }
        }

        true
    }

    /// Stop the event forwarder and drop every subscriber. Idempotent.
    pub fn close(&self) {
        if let Some(handle) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.lock_state().subscribers.clear();
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_state().subscribers.retain(|(sid, _)| *sid != id);
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Disposer returned by [`ConnectivityMonitor::subscribe`]
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    monitor: Weak<ConnectivityMonitor>,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.unsubscribe(self.id);
        }
    }
}
