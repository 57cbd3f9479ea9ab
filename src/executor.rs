//! Policy-driven execution.
//!
//! A [`ResilienceExecutor`] keeps one set of primitives per registered policy name and runs
//! every call through the patterns that policy enables, outermost first:
//!
//! ```text
//! Bulkhead -> RateLimiter -> CircuitBreaker -> Retry -> Timeout -> operation
//! ```
//!
//! Retry wraps the breaker call, so every attempt is bounded by the timeout and reported to the
//! breaker on its own. An open circuit is not retryable: it ends the retry campaign at once.
//! Errors from any layer are returned unchanged.
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::context::ExecutionContext;
//! use resilience_runtime::executor::ResilienceExecutor;
//! use resilience_runtime::policy::{PolicyConfig, RetryConfig, TimeoutConfig};
//!
//! #[derive(Debug)]
//! struct Unavailable;
//! impl std::fmt::Display for Unavailable {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "unavailable") }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let executor = ResilienceExecutor::<Unavailable>::new();
//! executor
//!     .register_policy(
//!         PolicyConfig::new("inventory")
//!             .with_timeout(TimeoutConfig::new(Duration::from_millis(250)))
//!             .with_retry(RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(5))),
//!     )
//!     .unwrap();
//!
//! let ctx = ExecutionContext::background();
//! let stock = executor
//!     .execute_with_result(&ctx, "inventory", |_| async { Ok::<_, Unavailable>(12) })
//!     .await
//!     .unwrap();
//! assert_eq!(stock, 12);
//! # });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::time::Instant;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::context::ExecutionContext;
use crate::error::{InvalidPolicyError, ResilienceError};
use crate::metrics::{ExecutionMetrics, MetricsRecorder, NoopMetricsRecorder};
use crate::policy::PolicyConfig;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryExecutor, RetryPredicate};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::timeout::TimeoutPolicy;

/// The live primitives for one registered policy. Built once per registration and shared by
/// every call, so breaker counters, bucket contents and bulkhead occupancy persist across calls.
struct PolicyRuntime<E> {
    config: PolicyConfig,
    bulkhead: Option<Bulkhead>,
    rate_limiter: Option<RateLimiter>,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryExecutor<E>>,
    timeout: Option<TimeoutPolicy>,
}

/// What happened along the way, for [`ExecutionMetrics`].
#[derive(Debug, Default)]
struct CallTrace {
    bulkhead_queued: Option<bool>,
    rate_limited: Option<bool>,
    retries: Option<u32>,
}

impl<E> PolicyRuntime<E> {
    async fn run<T, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        operation: &Op,
        trace: &mut CallTrace,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        ctx.check()?;

        let _permit = match &self.bulkhead {
            Some(bulkhead) => {
                let permit = bulkhead.acquire(ctx).await?;
                trace.bulkhead_queued = Some(permit.was_queued());
                Some(permit)
            }
            None => None,
        };

        if let Some(limiter) = &self.rate_limiter {
            let decision = limiter.check(ctx);
            trace.rate_limited = Some(decision.is_err());
            decision.map_err(ResilienceError::RateLimited)?;
        }

        match &self.retry {
            Some(retry) => {
                let (result, stats) = retry
                    .execute_with_stats(ctx, move |attempt_ctx| async move {
                        self.attempt(&attempt_ctx, operation).await
                    })
                    .await;
                trace.retries = Some(stats.retries());
                result
            }
            None => self.attempt(ctx, operation).await,
        }
    }

    /// One attempt: breaker admission around a timeout-bounded call.
    async fn attempt<T, Fut, Op>(&self, ctx: &ExecutionContext, operation: &Op) -> Result<T, ResilienceError<E>>
    where
        Op: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match &self.breaker {
            Some(breaker) => {
                breaker.execute(ctx, move |ctx| async move { self.bounded(&ctx, operation).await }).await
            }
            None => self.bounded(ctx, operation).await,
        }
    }

    async fn bounded<T, Fut, Op>(&self, ctx: &ExecutionContext, operation: &Op) -> Result<T, ResilienceError<E>>
    where
        Op: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let call = move |ctx: ExecutionContext| async move { operation(ctx).await.map_err(ResilienceError::Inner) };
        match &self.timeout {
            Some(timeout) => timeout.execute(ctx, call).await,
            None => ctx.run(call(ctx.clone())).await?,
        }
    }
}

/// Runs operations under named, hot-swappable resilience policies.
///
/// Registration swaps an immutable snapshot of the policy table, so lookups on the call path
/// never take a lock.
pub struct ResilienceExecutor<E> {
    policies: ArcSwap<HashMap<String, Arc<PolicyRuntime<E>>>>,
    metrics: Arc<dyn MetricsRecorder>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    retry_if: Option<RetryPredicate<E>>,
}

impl<E: 'static> std::fmt::Debug for ResilienceExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceExecutor")
            .field("policies", &self.policy_names())
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl<E: 'static> Default for ResilienceExecutor<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> ResilienceExecutor<E> {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ResilienceExecutorBuilder<E> {
        ResilienceExecutorBuilder::new()
    }

    /// Validate `config` and make it live under `config.name`.
    ///
    /// Replacing a registration starts the policy with fresh primitive state. Registering a
    /// config identical to the live one is a no-op that keeps the existing state.
    ///
    /// # Errors
    /// `InvalidPolicyError` naming the first offending field. Whatever was registered under
    /// the name before stays active.
    pub fn register_policy(&self, config: PolicyConfig) -> Result<(), InvalidPolicyError> {
        config.validate()?;
        if self.policies.load().get(&config.name).is_some_and(|live| live.config == config) {
            return Ok(());
        }

        let runtime = Arc::new(self.build_runtime(config)?);
        let name = runtime.config.name.clone();
        let previous = self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(name.clone(), runtime.clone());
            next
        });

        if previous.contains_key(&name) {
            tracing::warn!(policy = %name, "replaced resilience policy");
        } else {
            tracing::info!(
                policy = %name,
                circuit_breaker = runtime.breaker.is_some(),
                retry = runtime.retry.is_some(),
                timeout = runtime.timeout.is_some(),
                rate_limit = runtime.rate_limiter.is_some(),
                bulkhead = runtime.bulkhead.is_some(),
                "registered resilience policy"
            );
        }
        Ok(())
    }

    /// Remove a policy. Calls already running under it finish with the old primitives.
    pub fn unregister_policy(&self, name: &str) -> bool {
        let previous = self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(name);
            next
        });
        let removed = previous.contains_key(name);
        if removed {
            tracing::info!(policy = %name, "unregistered resilience policy");
        }
        removed
    }

    /// Registered names, sorted.
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn policy_config(&self, name: &str) -> Option<PolicyConfig> {
        self.policies.load().get(name).map(|rt| rt.config.clone())
    }

    /// Breaker state for `name`, if the policy exists and has a breaker.
    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.policies.load().get(name).and_then(|rt| rt.breaker.as_ref().map(CircuitBreaker::state))
    }

    /// Run a unit-returning operation under `policy_name`.
    pub async fn execute<Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        policy_name: &str,
        operation: Op,
    ) -> Result<(), ResilienceError<E>>
    where
        Op: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.execute_with_result(ctx, policy_name, operation).await
    }

    /// Run `operation` under `policy_name`. The operation may be invoked more than once when
    /// the policy retries.
    ///
    /// # Errors
    /// `PolicyNotFound` for an unknown name, any pattern error raised along the pipeline,
    /// `Context` when `ctx` finishes first, or `Inner` carrying the operation's own error.
    pub async fn execute_with_result<T, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        policy_name: &str,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let runtime = self
            .policies
            .load()
            .get(policy_name)
            .cloned()
            .ok_or_else(|| ResilienceError::PolicyNotFound { name: policy_name.to_string() })?;

        let start = Instant::now();
        let mut trace = CallTrace::default();
        let result = runtime.run(ctx, &operation, &mut trace).await;

        let mut metrics = ExecutionMetrics::new(policy_name, start.elapsed(), result.is_ok()).with_context(ctx);
        if let Some(breaker) = &runtime.breaker {
            metrics = metrics.with_circuit_state(breaker.state());
        }
        if let Some(retries) = trace.retries {
            metrics = metrics.with_retry_attempts(retries);
        }
        if let Some(limited) = trace.rate_limited {
            metrics = metrics.with_rate_limited(limited);
        }
        if let Some(queued) = trace.bulkhead_queued {
            metrics = metrics.with_bulkhead_queued(queued);
        }
        self.metrics.record_execution(ctx, &metrics);

        result
    }

    fn build_runtime(&self, config: PolicyConfig) -> Result<PolicyRuntime<E>, InvalidPolicyError> {
        let name = config.name.as_str();
        let bulkhead = config
            .bulkhead
            .map(|c| Bulkhead::new(name, c).map(|b| b.with_metrics(self.metrics.clone())))
            .transpose()?;
        let rate_limiter = config
            .rate_limit
            .map(|c| {
                RateLimiter::new(name, c)
                    .map(|r| r.with_clock(self.clock.clone()).with_metrics(self.metrics.clone()))
            })
            .transpose()?;
        let breaker = config
            .circuit_breaker
            .map(|c| {
                CircuitBreaker::new(name, c)
                    .map(|b| b.with_clock(self.clock.clone()).with_metrics(self.metrics.clone()))
            })
            .transpose()?;
        let retry = config
            .retry
            .map(|c| {
                RetryExecutor::builder()
                    .name(name)
                    .config(c)
                    .sleeper(self.sleeper.clone())
                    .metrics(self.metrics.clone())
                    .build()
                    .map(|r| match &self.retry_if {
                        Some(predicate) => r.with_retry_if(predicate.clone()),
                        None => r,
                    })
            })
            .transpose()?;
        let timeout = config.timeout.as_ref().map(|c| TimeoutPolicy::new(name, c)).transpose()?;

        Ok(PolicyRuntime { bulkhead, rate_limiter, breaker, retry, timeout, config })
    }
}

/// Builder for [`ResilienceExecutor`].
pub struct ResilienceExecutorBuilder<E> {
    metrics: Arc<dyn MetricsRecorder>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    retry_if: Option<RetryPredicate<E>>,
}

impl<E: 'static> Default for ResilienceExecutorBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> ResilienceExecutorBuilder<E> {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(NoopMetricsRecorder),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            retry_if: None,
        }
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Time source for breakers and rate limiters.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper for retry backoff.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the default retry predicate for every policy.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> ResilienceExecutor<E> {
        ResilienceExecutor {
            policies: ArcSwap::from_pointee(HashMap::new()),
            metrics: self.metrics,
            clock: self.clock,
            sleeper: self.sleeper,
            retry_if: self.retry_if,
        }
    }
}
