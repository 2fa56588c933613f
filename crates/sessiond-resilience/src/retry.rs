//! Retry execution
//!
//! Runs an operation up to `max_retries + 1` times, sleeping the policy's
//! backoff between attempts. Errors a classifier marks non-retryable end the
//! loop immediately. When attempts run out the last error is returned
//! unchanged.

use crate::backoff::RetryPolicy;
use sessiond_error::{Classify, ErrorKind};
use std::fmt::Display;
use std::future::Future;

/// Decides whether an error is worth another attempt
pub trait RetryClassifier<E> {
    /// Check if the error is retryable
    fn is_retryable(&self, error: &E) -> bool;
}

/// Classifier for errors that already carry an [`ErrorKind`]
#[derive(Debug, Clone, Copy, Default)]
pub struct KindClassifier;

impl<E: Classify> RetryClassifier<E> for KindClassifier {
    fn is_retryable(&self, error: &E) -> bool {
        error.kind().is_retryable()
    }
}

/// Classifier for opaque errors, inspecting their rendered message.
///
/// Use only at the boundary where untyped failures enter the system.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageClassifier;

impl<E: Display> RetryClassifier<E> for MessageClassifier {
    fn is_retryable(&self, error: &E) -> bool {
        ErrorKind::classify(None, None, &error.to_string()).is_retryable()
    }
}

/// Classifier backed by a predicate
#[derive(Debug, Clone, Copy)]
pub struct PredicateClassifier<F>(pub F);

impl<E, F> RetryClassifier<E> for PredicateClassifier<F>
where
    F: Fn(&E) -> bool,
{
    fn is_retryable(&self, error: &E) -> bool {
        (self.0)(error)
    }
}

struct OperationAttempt<'a> {
    label: &'a str,
    attempt: u32,
    max_attempts: u32,
}

impl OperationAttempt<'_> {
    fn is_last(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

/// Retry `operation` under `policy`, classifying errors by their kind
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    with_retry_classified(label, policy, &KindClassifier, operation).await
}

/// Retry `operation` under `policy` with a custom classifier
pub async fn with_retry_classified<T, E, F, Fut, C>(
    label: &str,
    policy: &RetryPolicy,
    classifier: &C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: RetryClassifier<E> + ?Sized,
{
    let mut state = OperationAttempt {
        label,
        attempt: 0,
        max_attempts: policy.max_attempts(),
    };

    loop {
        let error = match operation().await {
            Ok(value) => {
                if state.attempt > 0 {
                    tracing::debug!(
                        operation = state.label,
                        attempts = state.attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !classifier.is_retryable(&error) {
            tracing::debug!(
                operation = state.label,
                attempt = state.attempt + 1,
                error = %error,
                "Non-retryable failure"
            );
            return Err(error);
        }

        if state.is_last() {
            tracing::warn!(
                operation = state.label,
                attempts = state.max_attempts,
                error = %error,
                "Retries exhausted"
            );
            return Err(error);
        }

        let delay = policy.jittered_delay(state.attempt);
        tracing::debug!(
            operation = state.label,
            attempt = state.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        state.attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiond_error::SessionError;
    use sessiond_testing::ScriptedOperation;
    use std::time::Duration;

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(retries)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_try() {
        let op = ScriptedOperation::new().then_ok(7);
        let result = with_retry("first", &fast_policy(2), || op.call()).await;
        assert_eq!(result, Ok(7));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_and_returns_last_error() {
        let op = ScriptedOperation::<()>::new()
            .then_err(SessionError::Network("first".into()))
            .then_err(SessionError::Network("second".into()))
            .then_err(SessionError::Network("third".into()));

        let result = with_retry("exhaust", &fast_policy(2), || op.call()).await;
        assert_eq!(result, Err(SessionError::Network("third".into())));
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_backoff_between_attempts() {
        let op = ScriptedOperation::<()>::new()
            .then_err(SessionError::Network("down".into()))
            .then_err(SessionError::Network("down".into()))
            .then_err(SessionError::Network("down".into()));

        let _ = with_retry("gaps", &fast_policy(2), || op.call()).await;

        let at = op.call_instants();
        assert_eq!(at.len(), 3);
        assert_eq!(at[1] - at[0], Duration::from_millis(100));
        assert_eq!(at[2] - at[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_short_circuits() {
        let op = ScriptedOperation::<()>::new()
            .then_err(SessionError::Auth("Invalid credentials".into()))
            .then_ok(());

        let result = with_retry("auth", &fast_policy(3), || op.call()).await;
        assert_eq!(result, Err(SessionError::Auth("Invalid credentials".into())));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_error_is_retried() {
        let op = ScriptedOperation::new()
            .then_err(SessionError::Other("something odd".into()))
            .then_ok(1);

        let result = with_retry("unclassified", &fast_policy(1), || op.call()).await;
        assert_eq!(result, Ok(1));
        assert_eq!(op.calls(), 2);
    }

    #[test]
    fn test_blocking_caller_gets_first_success() {
        let op = ScriptedOperation::new().then_ok("ready");
        let result = tokio_test::block_on(with_retry("blocking", &fast_policy(0), || op.call()));
        let value = tokio_test::assert_ok!(result);
        assert_eq!(value, "ready");
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_one_attempt() {
        let op = ScriptedOperation::<()>::new().then_err(SessionError::Network("x".into()));
        let result = with_retry("once", &RetryPolicy::no_retry(), || op.call()).await;
        assert!(result.is_err());
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_classifier_for_opaque_errors() {
        let mut calls = 0;
        let result: Result<(), String> =
            with_retry_classified("opaque", &fast_policy(3), &MessageClassifier, || {
                calls += 1;
                async { Err("Invalid login credentials".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: Result<(), String> =
            with_retry_classified("opaque", &fast_policy(2), &MessageClassifier, || {
                calls += 1;
                async { Err("socket hang up".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_classifier() {
        let never = PredicateClassifier(|_: &SessionError| false);
        let op = ScriptedOperation::<()>::new().then_err(SessionError::Network("x".into()));
        let _ = with_retry_classified("closure", &fast_policy(5), &never, || op.call()).await;
        assert_eq!(op.calls(), 1);
    }
}
