//! In-flight request registry
//!
//! Maps a [`Fingerprint`] to the shared outcome of the request currently
//! running for it. Lookup and insertion happen under one map-shard lock,
//! so two identical calls can never both start work.
//!
//! Each request runs on its own task. Callers that stop waiting only stop
//! observing it; the request still completes and leaves the registry.

use crate::fingerprint::Fingerprint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use sessiond_error::SessionError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// A request outcome that any number of callers can await
pub type SharedRequest<T> = Shared<BoxFuture<'static, Result<T, SessionError>>>;

struct InFlight<T: Clone> {
    id: u64,
    started_at: Instant,
    request: SharedRequest<T>,
}

/// How a caller was attached to a request
pub enum Admission<T: Clone> {
    /// An identical request was already running
    Joined(SharedRequest<T>),
    /// This caller started the request
    Started(SharedRequest<T>),
}

impl<T: Clone> Admission<T> {
    /// The shared outcome, however it was obtained
    pub fn into_request(self) -> SharedRequest<T> {
        match self {
            Admission::Joined(request) | Admission::Started(request) => request,
        }
    }

    /// True if this caller joined an existing request
    pub fn joined(&self) -> bool {
        matches!(self, Admission::Joined(_))
    }
}

/// State of a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Nothing running
    Idle,
    /// A request is running
    InFlight {
        /// When it started
        since: Instant,
    },
}

/// At most one in-flight request per fingerprint
pub struct InFlightRegistry<T: Clone> {
    entries: Arc<DashMap<Fingerprint, InFlight<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone> std::fmt::Debug for InFlightRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("pending", &self.entries.len())
            .finish()
    }
}

impl<T: Clone> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the request running for `fingerprint`, or start one with `start`.
    ///
    /// `start` runs while the fingerprint's slot is locked and must not touch
    /// this registry. If it fails, nothing is registered. The work is spawned
    /// onto the Tokio runtime and its entry removes itself on completion,
    /// whether or not anyone is still awaiting it.
    pub fn join_or_start<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        start: F,
    ) -> Result<Admission<T>, SessionError>
    where
        F: FnOnce() -> Result<Fut, SessionError>,
        Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
    {
        match self.entries.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(fingerprint = %fingerprint, "Joining in-flight request");
                Ok(Admission::Joined(entry.get().request.clone()))
            }
            Entry::Vacant(slot) => {
                let work = start()?;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let entries = Arc::clone(&self.entries);
                let key = fingerprint.clone();

                let task = tokio::spawn(async move {
                    let outcome = work.await;
                    entries.remove_if(&key, |_, entry| entry.id == id);
                    outcome
                });
                let request = async move {
                    task.await.unwrap_or_else(|err| {
                        tracing::error!(error = %err, "In-flight request task failed");
                        Err(SessionError::Other(format!("request task failed: {err}")))
                    })
                }
                .boxed()
                .shared();

                slot.insert(InFlight {
                    id,
                    started_at: Instant::now(),
                    request: request.clone(),
                });
                Ok(Admission::Started(request))
            }
        }
    }

    /// State of a fingerprint
    pub fn state(&self, fingerprint: &Fingerprint) -> RequestState {
        match self.entries.get(fingerprint) {
            Some(entry) => RequestState::InFlight {
                since: entry.started_at,
            },
            None => RequestState::Idle,
        }
    }

    /// Number of distinct requests in flight
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry; running requests still complete for their callers
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiond_testing::ScriptedOperation;
    use std::time::Duration;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::builder("test").arg(name).build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_share_one_call() {
        let registry = InFlightRegistry::<u32>::new();
        let op = ScriptedOperation::new().then_delayed(Duration::from_millis(100), Ok(7));

        let first = registry
            .join_or_start(&fp("a"), || Ok(op.call()))
            .unwrap();
        let second = registry
            .join_or_start(&fp("a"), || Ok(op.call()))
            .unwrap();

        assert!(!first.joined());
        assert!(second.joined());
        assert_eq!(registry.len(), 1);

        let (a, b) = tokio::join!(first.into_request(), second.into_request());
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(op.calls(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_cleared() {
        let registry = InFlightRegistry::<u32>::new();
        let op = ScriptedOperation::new()
            .then_delayed(Duration::from_millis(10), Err(SessionError::Network("x".into())))
            .then_ok(1);

        let a = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        let b = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        let (a, b) = tokio::join!(a.into_request(), b.into_request());
        assert!(a.is_err());
        assert_eq!(a, b);

        let retry = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        assert!(!retry.joined());
        assert_eq!(retry.into_request().await, Ok(1));
        assert_eq!(op.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_fingerprints_run_separately() {
        let registry = InFlightRegistry::<u32>::new();
        let op = ScriptedOperation::new().then_ok(1).then_ok(2);

        let a = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        let b = registry.join_or_start(&fp("b"), || Ok(op.call())).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!b.joined());

        let _ = tokio::join!(a.into_request(), b.into_request());
        assert_eq!(op.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_start_registers_nothing() {
        let registry = InFlightRegistry::<u32>::new();
        let result = registry.join_or_start(&fp("a"), || {
            Err::<std::future::Ready<Result<u32, SessionError>>, _>(SessionError::Offline)
        });
        assert!(matches!(result, Err(SessionError::Offline)));
        assert_eq!(registry.state(&fp("a")), RequestState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_and_clear() {
        let registry = InFlightRegistry::<u32>::new();
        let op = ScriptedOperation::new().then_delayed(Duration::from_secs(1), Ok(1));

        let admission = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        assert!(matches!(registry.state(&fp("a")), RequestState::InFlight { .. }));

        registry.clear();
        assert_eq!(registry.state(&fp("a")), RequestState::Idle);
        assert_eq!(admission.into_request().await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unawaited_request_runs_to_completion() {
        let registry = InFlightRegistry::<u32>::new();
        let op = ScriptedOperation::new()
            .then_delayed(Duration::from_millis(200), Ok(1))
            .then_ok(2);

        let admission = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        drop(admission);
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.is_empty());

        let next = registry.join_or_start(&fp("a"), || Ok(op.call())).unwrap();
        assert!(!next.joined());
        assert_eq!(next.into_request().await, Ok(2));
    }
}
