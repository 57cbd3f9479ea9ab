//! Circuit breaker state machine.
//!
//! - **Closed**: calls pass through. `failure_threshold` consecutive failures open the circuit.
//! - **Open**: calls are rejected with [`CircuitOpenError`] without running the operation until
//!   `timeout` has elapsed since the circuit opened.
//! - **HalfOpen**: up to `half_open_max_calls` probes run concurrently. `success_threshold`
//!   successful probes close the circuit; any failed probe reopens it with a fresh open time.
//!
//! State lives behind a single mutex that is held only for the O(1) admission and outcome
//! updates, never across the wrapped operation. Every transition bumps a generation counter so
//! that an outcome from a call admitted under an earlier state is discarded instead of being
//! applied to the new one.
//!
//! Clones share state, so one breaker can be handed to many tasks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::{Clock, MonotonicClock};
use crate::context::ExecutionContext;
use crate::error::{CircuitOpenError, ErrorCode, ErrorMeta, InvalidPolicyError, ResilienceError};
use crate::metrics::{MetricsRecorder, NoopMetricsRecorder};
use crate::policy::CircuitBreakerConfig;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Duration,
    opened_at_wall: Option<DateTime<Utc>>,
    closed_calls: u64,
    closed_failures: u64,
    failure_rate: f64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            opened_at: Duration::ZERO,
            opened_at_wall: None,
            closed_calls: 0,
            closed_failures: 0,
            failure_rate: 0.0,
        }
    }

    fn trip(&mut self, now: Duration) {
        if self.state == CircuitState::Closed && self.closed_calls > 0 {
            self.failure_rate = self.closed_failures as f64 / self.closed_calls as f64;
        }
        self.state = CircuitState::Open;
        self.generation += 1;
        self.opened_at = now;
        self.opened_at_wall = Some(Utc::now());
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
    }

    fn close(&mut self) {
        *self = Self { generation: self.generation + 1, ..Self::new() };
    }
}

/// Outstanding permission to run one call. Dropping it unsettled (cancellation, panic)
/// gives a half-open probe slot back without recording an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }
        let mut st = self.breaker.state.lock();
        if st.generation == self.generation && st.state == CircuitState::HalfOpen {
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, InvalidPolicyError> {
        let name = name.into();
        config
            .validate()
            .map_err(|e| e.prefixed("circuit_breaker").for_policy(name.clone()))?;
        Ok(Self {
            name: Arc::from(name),
            config,
            state: Arc::new(Mutex::new(BreakerState::new())),
            clock: Arc::new(MonotonicClock::default()),
            metrics: Arc::new(NoopMetricsRecorder),
        })
    }

    /// Inject a custom clock, e.g. [`crate::clock::ManualClock`] in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. An Open breaker whose timeout has passed still reports Open until the
    /// next call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let st = self.state.lock();
        CircuitSnapshot {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            half_open_in_flight: st.half_open_in_flight,
            opened_at: st.opened_at_wall,
            failure_rate: st.failure_rate,
        }
    }

    /// Force the breaker Closed and clear every counter.
    pub fn reset(&self, ctx: &ExecutionContext) {
        let previous = {
            let mut st = self.state.lock();
            let previous = st.state;
            st.close();
            previous
        };
        if previous != CircuitState::Closed {
            self.announce(ctx, previous, CircuitState::Closed, 0);
        }
    }

    /// Run `operation` if the breaker admits it and record its outcome.
    ///
    /// Any `Err` except a context error counts as a failure. A context error (the caller
    /// gave up) records nothing and frees a half-open probe slot.
    ///
    /// # Errors
    /// `ResilienceError::CircuitOpen` if the circuit is open or every probe slot is taken,
    /// `ResilienceError::Context` if `ctx` finishes first, otherwise whatever the operation
    /// returned.
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
        let admission = self.admit(ctx).map_err(ResilienceError::CircuitOpen)?;

        match ctx.run(operation(ctx.clone())).await {
            Err(ctx_err) => Err(ctx_err.into()),
            Ok(Err(err)) if err.is_context() => Err(err),
            Ok(result) => {
                self.settle(ctx, admission, result.is_ok());
                result
            }
        }
    }

    fn admit(&self, ctx: &ExecutionContext) -> Result<Admission<'_>, CircuitOpenError> {
        let mut st = self.state.lock();
        let now = self.clock.now();

        let probe = match st.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = now.saturating_sub(st.opened_at);
                if elapsed < self.config.timeout {
                    return Err(self.open_error(&st, self.config.timeout - elapsed, ctx));
                }
                st.state = CircuitState::HalfOpen;
                st.generation += 1;
                st.consecutive_successes = 0;
                st.half_open_in_flight = 1;
                let generation = st.generation;
                drop(st);
                self.announce(ctx, CircuitState::Open, CircuitState::HalfOpen, 0);
                return Ok(Admission { breaker: self, generation, probe: true, settled: false });
            }
            CircuitState::HalfOpen => {
                if st.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(self.open_error(&st, Duration::ZERO, ctx));
                }
                st.half_open_in_flight += 1;
                tracing::debug!(
                    breaker = %self.name,
                    in_flight = st.half_open_in_flight,
                    max = self.config.half_open_max_calls,
                    "circuit breaker: half-open probe"
                );
                true
            }
        };

        Ok(Admission { breaker: self, generation: st.generation, probe, settled: false })
    }

    fn settle(&self, ctx: &ExecutionContext, mut admission: Admission<'_>, success: bool) {
        admission.settled = true;
        let mut st = self.state.lock();
        if st.generation != admission.generation {
            return;
        }

        let transition = match (st.state, success) {
            (CircuitState::Closed, true) => {
                st.consecutive_failures = 0;
                st.closed_calls += 1;
                None
            }
            (CircuitState::Closed, false) => {
                st.consecutive_failures += 1;
                st.closed_calls += 1;
                st.closed_failures += 1;
                if st.consecutive_failures >= self.config.failure_threshold {
                    st.trip(self.clock.now());
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, true) => {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.config.success_threshold {
                    st.close();
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, false) => {
                st.trip(self.clock.now());
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            (CircuitState::Open, _) => None,
        };
        let failures = st.consecutive_failures;
        drop(st);

        if let Some((from, to)) = transition {
            self.announce(ctx, from, to, failures);
        }
    }

    fn open_error(
        &self,
        st: &BreakerState,
        reset_after: Duration,
        ctx: &ExecutionContext,
    ) -> CircuitOpenError {
        CircuitOpenError {
            meta: ErrorMeta::new(ErrorCode::CircuitOpen).with_service(&*self.name).in_context(ctx),
            opened_at: st.opened_at_wall.unwrap_or_else(Utc::now),
            reset_after,
            failure_rate: st.failure_rate,
        }
    }

    fn announce(&self, ctx: &ExecutionContext, from: CircuitState, to: CircuitState, failures: u32) {
        self.metrics.record_circuit_state(ctx, &self.name, to);
        match to {
            CircuitState::Open if from == CircuitState::HalfOpen => tracing::warn!(
                breaker = %self.name,
                correlation_id = ctx.correlation_id(),
                "circuit breaker: probe failed → open"
            ),
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                failures,
                threshold = self.config.failure_threshold,
                correlation_id = ctx.correlation_id(),
                "circuit breaker → open"
            ),
            CircuitState::HalfOpen => tracing::info!(
                breaker = %self.name,
                correlation_id = ctx.correlation_id(),
                "circuit breaker → half-open"
            ),
            CircuitState::Closed => tracing::info!(
                breaker = %self.name,
                from = %from,
                correlation_id = ctx.correlation_id(),
                "circuit breaker → closed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::InMemoryMetricsRecorder;
    use futures::future::join_all;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    const OPEN_FOR: Duration = Duration::from_secs(30);

    fn breaker(failures: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(failures, OPEN_FOR).with_success_threshold(1);
        let breaker = CircuitBreaker::new("test", config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (breaker, clock)
    }

    async fn fail(b: &CircuitBreaker, ctx: &ExecutionContext) -> Result<(), ResilienceError<TestError>> {
        b.execute(ctx, |_| async { Err(ResilienceError::Inner(TestError("fail".into()))) }).await
    }

    async fn succeed(b: &CircuitBreaker, ctx: &ExecutionContext) -> Result<u32, ResilienceError<TestError>> {
        b.execute(ctx, |_| async { Ok(42) }).await
    }

    #[test]
    fn rejects_invalid_config() {
        let err = CircuitBreaker::new("x", CircuitBreakerConfig::new(0, OPEN_FOR)).unwrap_err();
        assert_eq!(err.field(), "circuit_breaker.failure_threshold");
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let (b, _) = breaker(3);
        let ctx = ExecutionContext::background();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b, &ctx).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let (b, clock) = breaker(3);
        let ctx = ExecutionContext::background();
        for _ in 0..3 {
            assert!(fail(&b, &ctx).await.unwrap_err().is_inner());
        }
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(10));
        let counter = &AtomicUsize::new(0);
        let err = b
            .execute(&ctx, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 0, "operation must not run while open");
        match err {
            ResilienceError::CircuitOpen(e) => {
                assert_eq!(e.reset_after, Duration::from_secs(20));
                assert_eq!(e.failure_rate, 1.0);
                assert_eq!(e.meta.service.as_deref(), Some("test"));
            }
            other => panic!("expected circuit open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successes_in_closed_state_reset_failure_count() {
        let (b, _) = breaker(3);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        let _ = fail(&b, &ctx).await;
        let _ = succeed(&b, &ctx).await;
        let _ = fail(&b, &ctx).await;
        let _ = fail(&b, &ctx).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_threshold() {
        let clock = ManualClock::new();
        let b = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(1, OPEN_FOR).with_success_threshold(2),
        )
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
        let ctx = ExecutionContext::background();

        let _ = fail(&b, &ctx).await;
        clock.advance(OPEN_FOR);

        succeed(&b, &ctx).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b, &ctx).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_circuit_reopens_if_half_open_probe_fails() {
        let (b, clock) = breaker(2);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        let _ = fail(&b, &ctx).await;

        clock.advance(OPEN_FOR);
        assert!(fail(&b, &ctx).await.unwrap_err().is_inner());
        assert_eq!(b.state(), CircuitState::Open);

        match succeed(&b, &ctx).await.unwrap_err() {
            ResilienceError::CircuitOpen(e) => assert_eq!(e.reset_after, OPEN_FOR, "fresh open time"),
            other => panic!("expected circuit open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_calls() {
        let (b, clock) = breaker(1);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        clock.advance(OPEN_FOR);

        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let probe = {
            let (b, ctx, release, started) = (b.clone(), ctx.clone(), release.clone(), started.clone());
            tokio::spawn(async move {
                b.execute(&ctx, |_| async move {
                    started.notify_one();
                    release.notified().await;
                    Ok::<_, ResilienceError<TestError>>(1)
                })
                .await
            })
        };
        started.notified().await;

        match succeed(&b, &ctx).await.unwrap_err() {
            ResilienceError::CircuitOpen(e) => assert_eq!(e.reset_after, Duration::ZERO),
            other => panic!("expected circuit open, got {other:?}"),
        }

        release.notify_one();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cancelled_probe_frees_slot_without_outcome() {
        let (b, clock) = breaker(1);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        clock.advance(OPEN_FOR);

        let call_ctx = ctx.child();
        let cancel = call_ctx.clone();
        let err = b
            .execute(&call_ctx, |_| async move {
                cancel.cancel();
                futures::future::pending::<Result<(), ResilienceError<TestError>>>().await
            })
            .await
            .unwrap_err();

        assert_eq!(err.context_error(), Some(crate::context::ContextError::Canceled));
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert_eq!(snap.half_open_in_flight, 0);
        assert_eq!(succeed(&b, &ctx).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn context_errors_from_operation_are_not_failures() {
        let (b, _) = breaker(1);
        let ctx = ExecutionContext::background();
        let err = b
            .execute(&ctx, |_| async {
                Err::<(), _>(ResilienceError::<TestError>::Context(crate::context::ContextError::DeadlineExceeded))
            })
            .await
            .unwrap_err();
        assert!(err.is_context());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cancelled_context_is_rejected_before_running() {
        let (b, _) = breaker(1);
        let ctx = ExecutionContext::background();
        ctx.cancel();
        let ran = &AtomicUsize::new(0);
        let err = b
            .execute(&ctx, move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_context());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_outcome_does_not_touch_new_state() {
        let (b, _) = breaker(1);
        let ctx = ExecutionContext::background();

        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let slow = {
            let (b, ctx, release, started) = (b.clone(), ctx.clone(), release.clone(), started.clone());
            tokio::spawn(async move {
                b.execute(&ctx, |_| async move {
                    started.notify_one();
                    release.notified().await;
                    Ok::<_, ResilienceError<TestError>>(())
                })
                .await
            })
        };
        started.notified().await;

        let _ = fail(&b, &ctx).await;
        assert_eq!(b.state(), CircuitState::Open);

        release.notify_one();
        slow.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Open, "success admitted while closed must not close an open breaker");
    }

    #[tokio::test]
    async fn transitions_are_reported_to_metrics() {
        let recorder = InMemoryMetricsRecorder::new();
        let (b, clock) = breaker(1);
        let b = b.with_metrics(Arc::new(recorder.clone()));
        let ctx = ExecutionContext::background();

        let _ = fail(&b, &ctx).await;
        clock.advance(OPEN_FOR);
        let _ = succeed(&b, &ctx).await;

        assert_eq!(
            recorder.circuit_states("test"),
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let (b, _) = breaker(1);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        assert_eq!(b.state(), CircuitState::Open);

        b.reset(&ctx);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b, &ctx).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn half_open_counter_recovers_on_panic() {
        let (b, clock) = breaker(1);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        clock.advance(OPEN_FOR);

        let result: Result<Result<(), ResilienceError<TestError>>, _> =
            std::panic::AssertUnwindSafe(async { b.execute(&ctx, |_| async { panic!("boom") }).await })
                .catch_unwind()
                .await;

        assert!(result.is_err());
        assert_eq!(b.snapshot().half_open_in_flight, 0);
    }

    #[tokio::test]
    async fn stress_concurrent_half_open_probes() {
        let (b, clock) = breaker(1);
        let ctx = ExecutionContext::background();
        let _ = fail(&b, &ctx).await;
        clock.advance(OPEN_FOR);

        let tasks = 200;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..tasks {
            let (b, g, ctx, ran) = (b.clone(), barrier.clone(), ctx.clone(), ran.clone());
            handles.push(tokio::spawn(async move {
                g.wait().await;
                let _ = b
                    .execute(&ctx, |_| async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::Inner(TestError("y".into())))
                    })
                    .await;
            }));
        }

        let _ = join_all(handles).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1, "exactly one probe may run");
        assert!(b.snapshot().half_open_in_flight <= b.config().half_open_max_calls);
        assert_eq!(b.state(), CircuitState::Open);
    }
}
