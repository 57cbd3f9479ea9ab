//! Timeout policy implementation

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::{ContextError, ExecutionContext};
use crate::error::{ErrorCode, ErrorMeta, InvalidPolicyError, ResilienceError, TimeoutError};
use crate::policy::TimeoutConfig;

/// Bounds an operation by a derived context.
///
/// The operation receives a child of the caller's context whose deadline is the timeout, so
/// cooperative code can stop early. The caller gets its answer when the timeout fires whether or
/// not the operation has noticed.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    name: Arc<str>,
    default: Duration,
    max: Duration,
}

impl TimeoutPolicy {
    pub fn new(name: impl Into<String>, config: &TimeoutConfig) -> Result<Self, InvalidPolicyError> {
        let name = name.into();
        config.validate().map_err(|e| e.prefixed("timeout").for_policy(name.clone()))?;
        Ok(Self { name: Arc::from(name), default: config.default, max: config.max })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    pub fn max_timeout(&self) -> Duration {
        self.max
    }

    /// Run with the configured default timeout.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run(ctx, self.default, operation).await
    }

    /// Run with a caller-requested timeout, capped at the configured maximum.
    pub async fn execute_with<T, E, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        requested: Duration,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run(ctx, requested.min(self.max), operation).await
    }

    async fn run<T, E, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        timeout: Duration,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        // An already finished parent is reported as-is, never as a timeout.
        ctx.check()?;

        let start = Instant::now();
        let bounded = ctx.with_timeout(timeout);
        let fut = operation(bounded.clone());

        let outcome = tokio::select! {
            biased;
            err = ctx.done() => Err(ResilienceError::Context(err)),
            result = fut => result,
            _ = tokio::time::sleep(timeout) => {
                let elapsed = start.elapsed();
                tracing::debug!(
                    policy = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    elapsed_ms = elapsed.as_millis() as u64,
                    correlation_id = ctx.correlation_id(),
                    "operation timed out"
                );
                Err(ResilienceError::Timeout(TimeoutError {
                    meta: ErrorMeta::new(ErrorCode::Timeout).with_service(&*self.name).in_context(ctx),
                    timeout,
                    elapsed,
                    cause: Some(ContextError::DeadlineExceeded),
                }))
            }
        };
        bounded.cancel();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    fn policy(ms: u64) -> TimeoutPolicy {
        TimeoutPolicy::new("search", &TimeoutConfig::new(Duration::from_millis(ms))).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let timeout = policy(100);
        let counter = &AtomicUsize::new(0);
        let result = timeout
            .execute(&ExecutionContext::background(), |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_operation() {
        let timeout = policy(50);
        let ctx = ExecutionContext::background().with_correlation_id("req-9");
        let result = timeout
            .execute(&ctx, |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;

        match result.unwrap_err() {
            ResilienceError::Timeout(e) => {
                assert_eq!(e.timeout, Duration::from_millis(50));
                assert_eq!(e.elapsed, Duration::from_millis(50));
                assert_eq!(e.cause, Some(ContextError::DeadlineExceeded));
                assert_eq!(e.meta.service.as_deref(), Some("search"));
                assert_eq!(e.meta.correlation_id.as_deref(), Some("req-9"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn operation_sees_derived_deadline() {
        let timeout = policy(50);
        let observed = &AtomicBool::new(false);
        let _ = timeout
            .execute(&ExecutionContext::background(), |inner| async move {
                assert!(inner.deadline().is_some());
                let err = inner.done().await;
                observed.store(err == ContextError::DeadlineExceeded, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn propagates_operation_errors() {
        let timeout = policy(1000);
        let result = timeout
            .execute(&ExecutionContext::background(), |_| async {
                Err::<(), _>(ResilienceError::Inner(TestError("operation failed".to_string())))
            })
            .await;

        match result.unwrap_err() {
            ResilienceError::Inner(e) => assert_eq!(e.0, "operation failed"),
            e => panic!("Expected Inner error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn cancelled_parent_is_propagated_verbatim() {
        let timeout = policy(1000);
        let ctx = ExecutionContext::background();
        ctx.cancel();
        let mut ran = false;
        let result: Result<(), ResilienceError<TestError>> = timeout
            .execute(&ctx, |_| {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(!ran);
        assert_eq!(result.unwrap_err().context_error(), Some(ContextError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_parent_deadline_is_not_a_timeout() {
        let timeout = policy(1000);
        let ctx = ExecutionContext::background().with_timeout(Duration::from_millis(20));
        let result: Result<(), ResilienceError<TestError>> = timeout
            .execute(&ctx, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err().context_error(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn requested_timeout_is_capped_at_max() {
        let config = TimeoutConfig::new(Duration::from_millis(100)).with_max(Duration::from_millis(300));
        let timeout = TimeoutPolicy::new("search", &config).unwrap();
        let result: Result<(), ResilienceError<TestError>> = timeout
            .execute_with(&ExecutionContext::background(), Duration::from_secs(10), |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        match result.unwrap_err() {
            ResilienceError::Timeout(e) => assert_eq!(e.timeout, Duration::from_millis(300)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = TimeoutPolicy::new("t", &TimeoutConfig::new(Duration::ZERO)).unwrap_err();
        assert_eq!(err.field(), "timeout.default");
    }
}
