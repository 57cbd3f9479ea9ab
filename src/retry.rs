//! Retry with exponential backoff and jitter.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Attempt 1 runs immediately. After failed attempt `n` the executor waits
//!   `min(max_delay, base_delay * multiplier^(n-1))`, perturbed by ± jitter, then tries again.
//! - The `retry_if` predicate decides which failures are retryable. By default application
//!   errors (`Inner`) and timeouts are; admission rejections (circuit open, rate limited,
//!   bulkhead full) never are.
//! - A cancelled or expired context stops the campaign at once with the context's own error,
//!   both between attempts and during the backoff sleep.
//! - Exhausting every attempt yields `RetryExhausted`, keeping the most recent failures.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::context::ExecutionContext;
//! use resilience_runtime::policy::RetryConfig;
//! use resilience_runtime::retry::RetryExecutor;
//! use resilience_runtime::sleeper::InstantSleeper;
//! use resilience_runtime::ResilienceError;
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retry = RetryExecutor::<MyErr>::from_config(
//!     "fetch",
//!     &RetryConfig::new(3, Duration::from_millis(100), Duration::from_secs(1)),
//! )
//! .unwrap()
//! .with_sleeper(InstantSleeper);
//! let ctx = ExecutionContext::background();
//! let result: Result<(), ResilienceError<MyErr>> =
//!     retry.execute(&ctx, |_| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert_eq!(result.unwrap_err().retry_exhausted_info(), Some((3, 3)));
//! # });
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::context::ExecutionContext;
use crate::error::{
    ErrorCode, ErrorMeta, InvalidPolicyError, ResilienceError, RetryExhaustedError,
    MAX_RETRY_FAILURES,
};
use crate::jitter::Jitter;
use crate::metrics::{MetricsRecorder, NoopMetricsRecorder};
use crate::policy::RetryConfig;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Predicate deciding whether a failed attempt may be retried.
pub type RetryPredicate<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;

/// Default predicate: application errors and timeouts are transient.
pub fn is_transient<E>(err: &ResilienceError<E>) -> bool {
    matches!(err, ResilienceError::Inner(_) | ResilienceError::Timeout(_))
}

/// How a retry campaign went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    /// Attempts actually started.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl RetryStats {
    /// Failed attempts before the final one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

pub struct RetryExecutor<E> {
    name: Arc<str>,
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    retry_if: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            retry_if: self.retry_if.clone(),
            sleeper: self.sleeper.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<E> RetryExecutor<E> {
    pub fn builder() -> RetryExecutorBuilder<E> {
        RetryExecutorBuilder::new()
    }

    /// Build from a validated [`RetryConfig`].
    pub fn from_config(name: impl Into<String>, config: &RetryConfig) -> Result<Self, InvalidPolicyError>
    where
        E: 'static,
    {
        Self::builder().name(name).config(*config).build()
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry_if(mut self, predicate: RetryPredicate<E>) -> Self {
        self.retry_if = predicate;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The jittered wait after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt as usize))
    }

    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.execute_with_stats(ctx, operation).await.0
    }

    /// Like [`execute`](Self::execute), also reporting how many attempts ran.
    pub async fn execute_with_stats<T, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        mut operation: Op,
    ) -> (Result<T, ResilienceError<E>>, RetryStats)
    where
        Op: FnMut(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let start = Instant::now();
        let mut failures: VecDeque<ResilienceError<E>> = VecDeque::with_capacity(MAX_RETRY_FAILURES);
        let stats = |attempts: u32| RetryStats { attempts, elapsed: start.elapsed() };

        let mut attempt: u32 = 0;
        loop {
            if let Err(err) = ctx.check() {
                return (Err(err.into()), stats(attempt));
            }
            attempt += 1;

            let err = match operation(ctx.clone()).await {
                Ok(value) => return (Ok(value), stats(attempt)),
                Err(err) => err,
            };
            // The caller's context wins over whatever the attempt reported.
            if let Some(ctx_err) = ctx.err() {
                return (Err(ctx_err.into()), stats(attempt));
            }
            if err.is_context() || !(self.retry_if)(&err) {
                return (Err(err), stats(attempt));
            }

            if failures.len() == MAX_RETRY_FAILURES {
                failures.pop_front();
            }
            failures.push_back(err);

            if attempt >= self.max_attempts {
                let elapsed = start.elapsed();
                tracing::warn!(
                    policy = %self.name,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "retry exhausted"
                );
                let meta = ErrorMeta::new(ErrorCode::RetryExhausted)
                    .with_service(&*self.name)
                    .in_context(ctx);
                let exhausted = RetryExhaustedError::new(meta, attempt as usize, elapsed, failures);
                return (Err(ResilienceError::RetryExhausted(exhausted)), stats(attempt));
            }

            let delay = self.delay_for(attempt);
            self.metrics.record_retry_attempt(ctx, &self.name, attempt + 1);
            tracing::debug!(
                policy = %self.name,
                failed_attempt = attempt,
                next_attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );

            tokio::select! {
                biased;
                err = ctx.done() => return (Err(err.into()), stats(attempt)),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

/// Builder for [`RetryExecutor`].
pub struct RetryExecutorBuilder<E> {
    name: String,
    config: RetryConfig,
    retry_if: Option<RetryPredicate<E>>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<E> Default for RetryExecutorBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RetryExecutorBuilder<E> {
    pub fn new() -> Self {
        Self {
            name: "retry".to_string(),
            config: RetryConfig::default(),
            retry_if: None,
            sleeper: Arc::new(TokioSleeper),
            metrics: Arc::new(NoopMetricsRecorder),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.base_delay = base;
        self.config.max_delay = max;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, fraction: f64) -> Self {
        self.config.jitter_percent = fraction;
        self
    }

    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<RetryExecutor<E>, InvalidPolicyError>
    where
        E: 'static,
    {
        self.config
            .validate()
            .map_err(|e| e.prefixed("retry").for_policy(self.name.clone()))?;
        Ok(RetryExecutor {
            name: Arc::from(self.name),
            max_attempts: self.config.max_attempts,
            backoff: self.config.backoff(),
            jitter: self.config.jitter(),
            retry_if: self.retry_if.unwrap_or_else(|| -> RetryPredicate<E> { Arc::new(is_transient::<E>) }),
            sleeper: self.sleeper,
            metrics: self.metrics,
        })
    }
}
