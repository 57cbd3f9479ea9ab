#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # resilience-runtime
//!
//! Resilience patterns for async Rust, driven by named, versioned policies.
//!
//! ## Patterns
//!
//! - **Circuit breaker** with half-open probing and per-attempt accounting
//! - **Retry** with exponential backoff and proportional jitter
//! - **Rate limiter** (token bucket or sliding window)
//! - **Bulkhead** with a bounded FIFO queue and queue timeout
//! - **Timeout** with a per-call clamp
//!
//! Every pattern takes an [`ExecutionContext`] and returns the context's own error when it is
//! cancelled or its deadline passes.
//!
//! ## Policies
//!
//! A [`Policy`] bundles optional pattern configs under a name. [`ResilienceExecutor`] runs
//! operations under registered policies, composed outermost first as
//! `Bulkhead -> RateLimiter -> CircuitBreaker -> Retry -> Timeout -> operation`.
//! [`PolicyService`] stores policies through a [`PolicyRepository`](repository::PolicyRepository)
//! and publishes a [`PolicyEvent`] for every change; [`PolicySync`](sync::PolicySync) keeps an
//! executor up to date from those events.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::prelude::*;
//!
//! #[derive(Debug)]
//! struct Unavailable;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let executor = ResilienceExecutor::<Unavailable>::new();
//! executor
//!     .register_policy(
//!         PolicyConfig::new("checkout")
//!             .with_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_secs(30)))
//!             .with_retry(RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(10))),
//!     )
//!     .unwrap();
//!
//! let ctx = ExecutionContext::background().with_correlation_id("req-42");
//! let result: Result<(), ResilienceError<Unavailable>> =
//!     executor.execute(&ctx, "checkout", |_ctx| async { Ok(()) }).await;
//! assert!(result.is_ok());
//! # });
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod jitter;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod rpc;
pub mod service;
pub mod sleeper;
pub mod sync;
pub mod timeout;

// Re-exports
pub use backoff::Backoff;
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::{ContextError, ExecutionContext};
pub use error::{
    BulkheadFullError, CircuitOpenError, ErrorCode, ErrorMeta, FieldViolation, InvalidPolicyError,
    RateLimitError, ResilienceError, RetryExhaustedError, TimeoutError,
};
pub use events::{EventPublisher, InMemoryEventPublisher, PolicyEvent, PolicyEventKind};
pub use executor::{ResilienceExecutor, ResilienceExecutorBuilder};
pub use jitter::Jitter;
pub use metrics::{
    ExecutionMetrics, InMemoryMetricsRecorder, MetricsRecorder, NoopMetricsRecorder,
    TracingMetricsRecorder,
};
pub use policy::{
    BulkheadConfig, CircuitBreakerConfig, Policy, PolicyConfig, RateLimitAlgorithm,
    RateLimitConfig, RetryConfig, TimeoutConfig,
};
pub use rate_limit::{Decision, RateLimiter};
pub use retry::{RetryExecutor, RetryExecutorBuilder, RetryStats};
pub use service::{PolicyError, PolicyService, PolicyWatch};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutPolicy;
