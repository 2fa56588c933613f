//! Timeout utilities
//!
//! [`with_timeout`] races an operation against a deadline. Whichever settles
//! first wins and the loser is dropped, so its eventual result is never
//! observed. [`Deadline`] scopes nest, letting an outer safety deadline force
//! a fallback regardless of what inner scopes are doing.

use serde::{Deserialize, Serialize};
use sessiond_error::SessionError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Callback fired when a deadline wins the race
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Timeout settings for a single attempt
#[derive(Clone, Serialize, Deserialize)]
pub struct TimeoutOptions {
    /// How long an attempt may run
    #[serde(rename = "timeout_ms", with = "crate::serde_millis")]
    pub timeout: Duration,
    /// Invoked once when the deadline fires
    #[serde(skip)]
    pub on_timeout: Option<TimeoutCallback>,
}

impl std::fmt::Debug for TimeoutOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutOptions")
            .field("timeout", &self.timeout)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            on_timeout: None,
        }
    }
}

impl TimeoutOptions {
    /// Create options with a timeout and no callback
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            on_timeout: None,
        }
    }

    /// Set the callback fired on timeout
    pub fn with_on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(callback));
        self
    }

    /// Short timeout for local or low-latency calls
    pub fn fast() -> Self {
        Self::new(Duration::from_secs(5))
    }

    /// Development-mode remote call timeout
    pub fn development() -> Self {
        Self::new(Duration::from_secs(10))
    }

    /// Production remote call timeout
    pub fn production() -> Self {
        Self::new(Duration::from_secs(35))
    }
}

/// Timeout error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Operation timed out after {}ms", .duration.as_millis())]
pub struct TimeoutError {
    /// The configured timeout
    pub duration: Duration,
}

impl From<TimeoutError> for SessionError {
    fn from(err: TimeoutError) -> Self {
        SessionError::Timeout {
            duration: err.duration,
        }
    }
}

/// Race any future against a deadline
pub async fn timeout_after<T>(
    duration: Duration,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Race a fallible operation against `options.timeout`.
///
/// Resolves exactly once. An operation failure before the deadline is
/// propagated unchanged; on expiry the callback runs and a timeout error
/// carrying the configured duration is returned.
pub async fn with_timeout<T, E, Fut>(options: &TimeoutOptions, operation: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    match timeout(options.timeout, operation).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(
                timeout_ms = options.timeout.as_millis() as u64,
                "Operation timed out"
            );
            if let Some(callback) = &options.on_timeout {
                callback();
            }
            Err(TimeoutError {
                duration: options.timeout,
            }
            .into())
        }
    }
}

/// A point in time by which work must finish.
///
/// Deadlines nest: [`Deadline::child`] never outlives its parent.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Create a new deadline
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Nested scope expiring after `timeout` or with this one, whichever is first
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout: timeout.min(self.remaining()),
        }
    }

    /// Check if deadline has passed
    pub fn is_expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    /// Get remaining time
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The full length of this scope
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute with remaining time as timeout
    pub async fn execute<T, E>(
        &self,
        future: impl Future<Output = Result<T, E>>,
    ) -> Result<T, DeadlineError<E>> {
        if self.is_expired() {
            return Err(DeadlineError::Expired);
        }

        match timeout(self.remaining(), future).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(DeadlineError::Inner(e)),
            Err(_) => Err(DeadlineError::Expired),
        }
    }

    /// Run `future`, or produce `fallback()` if the scope expires first
    pub async fn execute_or<T>(
        &self,
        future: impl Future<Output = T>,
        fallback: impl FnOnce() -> T,
    ) -> T {
        if self.is_expired() {
            return fallback();
        }

        match timeout(self.remaining(), future).await {
            Ok(value) => value,
            Err(_) => fallback(),
        }
    }
}

/// Deadline error
#[derive(Debug)]
pub enum DeadlineError<E> {
    /// Deadline expired
    Expired,
    /// Inner operation error
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for DeadlineError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "Deadline expired"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for DeadlineError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Expired => None,
            Self::Inner(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_success() {
        let options = TimeoutOptions::new(Duration::from_secs(1));
        let result: Result<i32, SessionError> = with_timeout(&options, async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expired_message() {
        let options = TimeoutOptions::new(Duration::from_millis(1000));
        let result: Result<i32, SessionError> = with_timeout(&options, async {
            tokio::time::sleep(Duration::from_millis(2000)).await;
            Ok(42)
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Operation timed out after 1000ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_propagates_original_error() {
        let options = TimeoutOptions::new(Duration::from_secs(1));
        let result: Result<(), SessionError> = with_timeout(&options, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(SessionError::Auth("Invalid credentials".into()))
        })
        .await;

        assert_eq!(result.unwrap_err(), SessionError::Auth("Invalid credentials".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_timeout_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let options = TimeoutOptions::new(Duration::from_millis(50)).with_on_timeout(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _: Result<(), SessionError> = with_timeout(&options, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_timeout_not_fired_on_success() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let options = TimeoutOptions::new(Duration::from_millis(50))
            .with_on_timeout(move || fired_clone.store(true, Ordering::SeqCst));

        let _: Result<(), SessionError> = with_timeout(&options, async { Ok(()) }).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_resolution_has_no_effect() {
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = completed.clone();
        let options = TimeoutOptions::new(Duration::from_millis(100));

        let result: Result<(), SessionError> = with_timeout(&options, async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            completed_clone.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after() {
        let slow = tokio::time::sleep(Duration::from_secs(1));
        let err = timeout_after(Duration::from_millis(1), slow).await.unwrap_err();
        assert_eq!(err.duration, Duration::from_millis(1));
    }

    #[test]
    fn test_timeout_presets() {
        assert_eq!(TimeoutOptions::development().timeout, Duration::from_secs(10));
        assert_eq!(TimeoutOptions::production().timeout, Duration::from_secs(35));
        assert!(TimeoutOptions::fast().timeout < TimeoutOptions::default().timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_clamped_to_parent() {
        let outer = Deadline::new(Duration::from_secs(5));
        let inner = outer.child(Duration::from_secs(10));
        assert!(inner.timeout() <= Duration::from_secs(5));

        let short = outer.child(Duration::from_secs(1));
        assert_eq!(short.timeout(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_execute_success() {
        let deadline = Deadline::new(Duration::from_secs(10));
        let result: Result<i32, DeadlineError<&str>> =
            deadline.execute(async { Ok::<_, &str>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_execute_expired() {
        let deadline = Deadline::new(Duration::from_millis(10));
        let result: Result<(), DeadlineError<&str>> = deadline
            .execute(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DeadlineError::Expired)));
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outer_scope_forces_fallback() {
        let outer = Deadline::new(Duration::from_millis(100));
        let value = outer
            .execute_or(
                async {
                    // Inner logic that never settles.
                    std::future::pending::<&str>().await
                },
                || "fallback",
            )
            .await;
        assert_eq!(value, "fallback");
    }
}
