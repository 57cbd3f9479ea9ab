//! Rate limiting.
//!
//! - [`RateLimitStrategy`]: the admission math, implemented by
//!   [`TokenBucket`](strategies::TokenBucket) and [`SlidingWindow`](strategies::SlidingWindow).
//! - [`RateLimiter`]: a named limiter built from a [`RateLimitConfig`] that reports to metrics
//!   and rejects with [`RateLimitError`].
//! - [`Decision`]: the result of a single check.
//!
//! Rate limiting never blocks or queues: a denied call fails immediately and carries the time
//! after which a retry could succeed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::context::ExecutionContext;
use crate::error::{ErrorCode, ErrorMeta, InvalidPolicyError, RateLimitError, ResilienceError};
use crate::metrics::{MetricsRecorder, NoopMetricsRecorder};
use crate::policy::{RateLimitAlgorithm, RateLimitConfig};

pub mod strategies;

pub use strategies::{SlidingWindow, TokenBucket};

/// The decision returned by a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Whole permits left after this one. Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        /// How long until a permit is expected to be available.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Admission logic. Implementations synchronize internally and decide in O(1) amortized time.
pub trait RateLimitStrategy: Send + Sync + fmt::Debug {
    fn try_acquire(&self, permits: u32) -> Decision;
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: Arc<str>,
    config: RateLimitConfig,
    strategy: Arc<dyn RateLimitStrategy>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Self, InvalidPolicyError> {
        let name = name.into();
        config.validate().map_err(|e| e.prefixed("rate_limit").for_policy(name.clone()))?;
        let strategy = build_strategy(&config, Arc::new(MonotonicClock::default()));
        Ok(Self { name: Arc::from(name), config, strategy, metrics: Arc::new(NoopMetricsRecorder) })
    }

    /// Swap the time source, e.g. for [`crate::clock::ManualClock`] in tests. Resets the
    /// limiter's counters.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.strategy = build_strategy(&self.config, clock);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one permit if available.
    pub fn allow(&self) -> bool {
        self.strategy.try_acquire(1).is_allowed()
    }

    /// Take one permit, reporting the decision to metrics.
    pub fn check(&self, ctx: &ExecutionContext) -> Result<Decision, RateLimitError> {
        let decision = self.strategy.try_acquire(1);
        self.metrics.record_rate_limit(ctx, &self.name, !decision.is_allowed());
        match decision {
            Decision::Allowed { .. } => Ok(decision),
            Decision::Denied { retry_after } => {
                tracing::debug!(
                    limiter = %self.name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    correlation_id = ctx.correlation_id(),
                    "rate limit exceeded"
                );
                Err(RateLimitError {
                    meta: ErrorMeta::new(ErrorCode::RateLimitExceeded)
                        .with_service(&*self.name)
                        .in_context(ctx),
                    limit: self.config.limit,
                    window: self.config.window,
                    retry_after,
                })
            }
        }
    }

    /// Run `operation` if a permit is available; otherwise fail immediately.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        ctx.check()?;
        self.check(ctx).map_err(ResilienceError::RateLimited)?;
        ctx.run(operation(ctx.clone())).await?
    }
}

fn build_strategy(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Arc<dyn RateLimitStrategy> {
    match config.algorithm {
        RateLimitAlgorithm::TokenBucket => {
            Arc::new(TokenBucket::new(config.burst_size, config.limit, config.window, clock))
        }
        RateLimitAlgorithm::SlidingWindow => {
            Arc::new(SlidingWindow::new(config.limit, config.window, clock))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::{InMemoryMetricsRecorder, MetricEvent};

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test")
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = RateLimiter::new("api", RateLimitConfig::token_bucket(0, Duration::from_secs(1), 1)).unwrap_err();
        assert_eq!(err.field(), "rate_limit.limit");
    }

    #[tokio::test]
    async fn execute_rejects_without_running() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::new("api", RateLimitConfig::sliding_window(1, Duration::from_secs(1)))
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
        let ctx = ExecutionContext::background().with_correlation_id("r-1");

        let first: Result<u8, ResilienceError<TestError>> = limiter.execute(&ctx, |_| async { Ok(1) }).await;
        assert_eq!(first.unwrap(), 1);

        let mut ran = false;
        let second: Result<u8, ResilienceError<TestError>> = limiter
            .execute(&ctx, |_| {
                ran = true;
                async { Ok(2) }
            })
            .await;
        assert!(!ran);
        match second.unwrap_err() {
            ResilienceError::RateLimited(e) => {
                assert_eq!(e.limit, 1);
                assert_eq!(e.window, Duration::from_secs(1));
                assert_eq!(e.retry_after, Duration::from_secs(1));
                assert_eq!(e.meta.correlation_id.as_deref(), Some("r-1"));
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    #[test]
    fn decisions_are_reported() {
        let recorder = InMemoryMetricsRecorder::new();
        let limiter = RateLimiter::new("api", RateLimitConfig::token_bucket(1, Duration::from_secs(60), 1))
        .unwrap()
        .with_clock(Arc::new(ManualClock::new()))
        .with_metrics(Arc::new(recorder.clone()));
        let ctx = ExecutionContext::background();

        assert!(limiter.check(&ctx).is_ok());
        assert!(limiter.check(&ctx).is_err());
        let limited: Vec<_> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MetricEvent::RateLimit { limited, .. } => Some(limited),
                _ => None,
            })
            .collect();
        assert_eq!(limited, vec![false, true]);
    }

    #[test]
    fn allow_uses_configured_algorithm() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::new("api", RateLimitConfig::token_bucket(2, Duration::from_secs(1), 3))
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
        assert_eq!((0..5).filter(|_| limiter.allow()).count(), 3, "burst capacity");
        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow(), "one token refilled after half a window");
        assert!(!limiter.allow());
    }
}
