//! Resilient operation composition
//!
//! Connectivity gate, then retry, then a fresh timeout per attempt:
//! `offline? -> with_retry(with_timeout(op()))`.

use crate::backoff::RetryPolicy;
use crate::connectivity::ConnectivityMonitor;
use crate::retry::with_retry;
use crate::timeout::{with_timeout, TimeoutOptions};
use sessiond_error::SessionError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runs remote operations under connectivity, retry and timeout policy
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    connectivity: Arc<ConnectivityMonitor>,
    active: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ResilientExecutor {
    /// Create an executor gated on `connectivity`
    pub fn new(connectivity: Arc<ConnectivityMonitor>) -> Self {
        Self {
            connectivity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The monitor this executor consults
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Executions currently in flight
    pub fn active_operations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run `operation` resiliently.
    ///
    /// Fails with [`SessionError::Offline`] without invoking the operation
    /// when offline. Otherwise every attempt gets its own timeout, and the
    /// final failure is returned once retries are exhausted or a
    /// non-retryable error appears.
    pub async fn execute_resiliently<T, F, Fut>(
        &self,
        label: &str,
        timeout: &TimeoutOptions,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        if !self.connectivity.is_online() {
            tracing::debug!(operation = label, "Refusing operation while offline");
            return Err(SessionError::Offline);
        }

        let _active = ActiveGuard::enter(&self.active);
        with_retry(label, policy, || with_timeout(timeout, operation())).await
    }

    /// Bind an operation and its policies into a reusable callable
    pub fn create_resilient_operation<T, F, Fut>(
        &self,
        label: impl Into<String>,
        timeout: TimeoutOptions,
        policy: RetryPolicy,
        operation: F,
    ) -> ResilientOperation<F>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        ResilientOperation {
            executor: self.clone(),
            label: label.into(),
            timeout,
            policy,
            operation,
        }
    }
}

/// An operation pre-bound to an executor and its policies
pub struct ResilientOperation<F> {
    executor: ResilientExecutor,
    label: String,
    timeout: TimeoutOptions,
    policy: RetryPolicy,
    operation: F,
}

impl<F> std::fmt::Debug for ResilientOperation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientOperation")
            .field("label", &self.label)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<F> ResilientOperation<F> {
    /// Label used in logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Invoke the bound operation under its policies
    pub async fn run<T, Fut>(&self) -> Result<T, SessionError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        self.executor
            .execute_resiliently(&self.label, &self.timeout, &self.policy, || (self.operation)())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiond_testing::ScriptedOperation;
    use std::time::Duration;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(retries)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_never_invokes() {
        let executor = ResilientExecutor::new(ConnectivityMonitor::new(false));
        let op = ScriptedOperation::new().then_ok(1);

        let result = executor
            .execute_resiliently("offline", &TimeoutOptions::fast(), &policy(3), || op.call())
            .await;

        assert_eq!(result, Err(SessionError::Offline));
        assert_eq!(result.unwrap_err().to_string(), "No internet connection");
        assert_eq!(op.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_fresh_timeout() {
        let executor = ResilientExecutor::new(ConnectivityMonitor::new(true));
        let op = ScriptedOperation::new()
            .then_delayed(Duration::from_secs(5), Ok(0))
            .then_ok(7);

        let result = executor
            .execute_resiliently(
                "fresh-timeout",
                &TimeoutOptions::new(Duration::from_secs(1)),
                &policy(2),
                || op.call(),
            )
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(op.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries() {
        let executor = ResilientExecutor::new(ConnectivityMonitor::new(true));
        let op = ScriptedOperation::new()
            .then_delayed(Duration::from_secs(5), Ok(0))
            .then_delayed(Duration::from_secs(5), Ok(0))
            .then_delayed(Duration::from_secs(5), Ok(0));

        let result = executor
            .execute_resiliently(
                "slow",
                &TimeoutOptions::new(Duration::from_millis(1000)),
                &policy(2),
                || op.call(),
            )
            .await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "Operation timed out after 1000ms"
        );
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_single_attempt() {
        let executor = ResilientExecutor::new(ConnectivityMonitor::new(true));
        let op = ScriptedOperation::<()>::new()
            .then_err(SessionError::Auth("Invalid credentials".into()));

        let result = executor
            .execute_resiliently("auth", &TimeoutOptions::fast(), &policy(3), || op.call())
            .await;

        assert!(matches!(result, Err(SessionError::Auth(_))));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_operations_tracked() {
        let executor = ResilientExecutor::new(ConnectivityMonitor::new(true));
        let op = ScriptedOperation::new().then_delayed(Duration::from_millis(500), Ok(()));

        let running = {
            let executor = executor.clone();
            let op = op.clone();
            tokio::spawn(async move {
                executor
                    .execute_resiliently("slow", &TimeoutOptions::fast(), &policy(0), || op.call())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.active_operations(), 1);

        running.await.unwrap().unwrap();
        assert_eq!(executor.active_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_operation_is_reusable() {
        let executor = ResilientExecutor::new(ConnectivityMonitor::new(true));
        let op = ScriptedOperation::new().then_ok(1).then_ok(2);

        let bound = executor.create_resilient_operation(
            "bound",
            TimeoutOptions::fast(),
            policy(1),
            || op.call(),
        );

        assert_eq!(bound.label(), "bound");
        assert_eq!(bound.run().await, Ok(1));
        assert_eq!(bound.run().await, Ok(2));
        assert_eq!(op.calls(), 2);
    }
}
