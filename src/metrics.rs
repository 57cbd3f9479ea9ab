//! Per-call execution metrics and the recorder sink every pattern reports into.
//!
//! - [`NoopMetricsRecorder`] - discards everything
//! - [`TracingMetricsRecorder`] - emits each callback as a `tracing` event
//! - [`InMemoryMetricsRecorder`] - bounded in-memory buffer, for tests and inspection
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::context::ExecutionContext;
//! use resilience_runtime::metrics::{ExecutionMetrics, InMemoryMetricsRecorder, MetricsRecorder};
//!
//! let recorder = InMemoryMetricsRecorder::new();
//! let ctx = ExecutionContext::background();
//! let metrics = ExecutionMetrics::new("checkout", Duration::from_millis(12), true).with_retry_attempts(1);
//! recorder.record_execution(&ctx, &metrics);
//! assert_eq!(recorder.executions()[0].retry_attempts(), Some(1));
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::circuit_breaker::CircuitState;
use crate::context::ExecutionContext;

/// Immutable outcome record for one executor call.
///
/// The `with_*` methods return a modified copy and leave `self` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionMetrics {
    policy_name: String,
    duration: Duration,
    success: bool,
    circuit_state: Option<CircuitState>,
    retry_attempts: Option<u32>,
    rate_limited: Option<bool>,
    bulkhead_queued: Option<bool>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ExecutionMetrics {
    pub fn new(policy_name: impl Into<String>, duration: Duration, success: bool) -> Self {
        Self {
            policy_name: policy_name.into(),
            duration,
            success,
            circuit_state: None,
            retry_attempts: None,
            rate_limited: None,
            bulkhead_queued: None,
            correlation_id: None,
            trace_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_circuit_state(&self, state: CircuitState) -> Self {
        Self { circuit_state: Some(state), ..self.clone() }
    }

    pub fn with_retry_attempts(&self, attempts: u32) -> Self {
        Self { retry_attempts: Some(attempts), ..self.clone() }
    }

    pub fn with_rate_limited(&self, limited: bool) -> Self {
        Self { rate_limited: Some(limited), ..self.clone() }
    }

    pub fn with_bulkhead_queued(&self, queued: bool) -> Self {
        Self { bulkhead_queued: Some(queued), ..self.clone() }
    }

    pub fn with_correlation_id(&self, id: impl Into<String>) -> Self {
        Self { correlation_id: Some(id.into()), ..self.clone() }
    }

    pub fn with_trace_id(&self, id: impl Into<String>) -> Self {
        Self { trace_id: Some(id.into()), ..self.clone() }
    }

    /// Copy correlation and trace ids from `ctx`.
    pub fn with_context(&self, ctx: &ExecutionContext) -> Self {
        Self {
            correlation_id: ctx.correlation_id().map(str::to_owned).or_else(|| self.correlation_id.clone()),
            trace_id: ctx.trace_id().map(str::to_owned).or_else(|| self.trace_id.clone()),
            ..self.clone()
        }
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.circuit_state
    }

    /// Failed attempts before the final outcome.
    pub fn retry_attempts(&self) -> Option<u32> {
        self.retry_attempts
    }

    pub fn rate_limited(&self) -> Option<bool> {
        self.rate_limited
    }

    pub fn bulkhead_queued(&self) -> Option<bool> {
        self.bulkhead_queued
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Sink for resilience metrics. Implementations must be cheap and must not block.
pub trait MetricsRecorder: Send + Sync + fmt::Debug {
    fn record_execution(&self, ctx: &ExecutionContext, metrics: &ExecutionMetrics);
    fn record_circuit_state(&self, ctx: &ExecutionContext, policy_name: &str, state: CircuitState);
    fn record_retry_attempt(&self, ctx: &ExecutionContext, policy_name: &str, attempt: u32);
    fn record_rate_limit(&self, ctx: &ExecutionContext, policy_name: &str, limited: bool);
    fn record_bulkhead_queue(&self, ctx: &ExecutionContext, policy_name: &str, queued: bool);
}

/// Discards all metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsRecorder;

impl MetricsRecorder for NoopMetricsRecorder {
    fn record_execution(&self, _ctx: &ExecutionContext, _metrics: &ExecutionMetrics) {}
    fn record_circuit_state(&self, _ctx: &ExecutionContext, _policy_name: &str, _state: CircuitState) {}
    fn record_retry_attempt(&self, _ctx: &ExecutionContext, _policy_name: &str, _attempt: u32) {}
    fn record_rate_limit(&self, _ctx: &ExecutionContext, _policy_name: &str, _limited: bool) {}
    fn record_bulkhead_queue(&self, _ctx: &ExecutionContext, _policy_name: &str, _queued: bool) {}
}

/// Emits every metric as a `tracing` event under the `resilience.metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsRecorder;

impl MetricsRecorder for TracingMetricsRecorder {
    fn record_execution(&self, ctx: &ExecutionContext, metrics: &ExecutionMetrics) {
        tracing::info!(
            target: "resilience.metrics",
            policy = metrics.policy_name(),
            duration_ms = metrics.duration().as_secs_f64() * 1000.0,
            success = metrics.success(),
            circuit_state = ?metrics.circuit_state(),
            retry_attempts = ?metrics.retry_attempts(),
            rate_limited = ?metrics.rate_limited(),
            bulkhead_queued = ?metrics.bulkhead_queued(),
            correlation_id = ctx.correlation_id(),
            "execution"
        );
    }

    fn record_circuit_state(&self, ctx: &ExecutionContext, policy_name: &str, state: CircuitState) {
        tracing::info!(
            target: "resilience.metrics",
            policy = policy_name,
            state = %state,
            correlation_id = ctx.correlation_id(),
            "circuit_state"
        );
    }

    fn record_retry_attempt(&self, ctx: &ExecutionContext, policy_name: &str, attempt: u32) {
        tracing::debug!(
            target: "resilience.metrics",
            policy = policy_name,
            attempt,
            correlation_id = ctx.correlation_id(),
            "retry_attempt"
        );
    }

    fn record_rate_limit(&self, ctx: &ExecutionContext, policy_name: &str, limited: bool) {
        tracing::debug!(
            target: "resilience.metrics",
            policy = policy_name,
            limited,
            correlation_id = ctx.correlation_id(),
            "rate_limit"
        );
    }

    fn record_bulkhead_queue(&self, ctx: &ExecutionContext, policy_name: &str, queued: bool) {
        tracing::debug!(
            target: "resilience.metrics",
            policy = policy_name,
            queued,
            correlation_id = ctx.correlation_id(),
            "bulkhead_queue"
        );
    }
}

/// One recorded callback.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Execution(ExecutionMetrics),
    CircuitState { policy: String, state: CircuitState },
    RetryAttempt { policy: String, attempt: u32 },
    RateLimit { policy: String, limited: bool },
    BulkheadQueue { policy: String, queued: bool },
}

/// Bounded in-memory recorder. Oldest events are evicted once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct InMemoryMetricsRecorder {
    events: Arc<Mutex<VecDeque<MetricEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl Default for InMemoryMetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetricsRecorder {
    /// Default cap: 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn executions(&self) -> Vec<ExecutionMetrics> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MetricEvent::Execution(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Circuit state transitions recorded for `policy`, in order.
    pub fn circuit_states(&self, policy: &str) -> Vec<CircuitState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MetricEvent::CircuitState { policy: p, state } if p == policy => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn retry_attempts(&self, policy: &str) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MetricEvent::RetryAttempt { policy: p, attempt } if p == policy => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn push(&self, event: MetricEvent) {
        let mut guard = self.events.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }
}

impl MetricsRecorder for InMemoryMetricsRecorder {
    fn record_execution(&self, _ctx: &ExecutionContext, metrics: &ExecutionMetrics) {
        self.push(MetricEvent::Execution(metrics.clone()));
    }

    fn record_circuit_state(&self, _ctx: &ExecutionContext, policy_name: &str, state: CircuitState) {
        self.push(MetricEvent::CircuitState { policy: policy_name.to_owned(), state });
    }

    fn record_retry_attempt(&self, _ctx: &ExecutionContext, policy_name: &str, attempt: u32) {
        self.push(MetricEvent::RetryAttempt { policy: policy_name.to_owned(), attempt });
    }

    fn record_rate_limit(&self, _ctx: &ExecutionContext, policy_name: &str, limited: bool) {
        self.push(MetricEvent::RateLimit { policy: policy_name.to_owned(), limited });
    }

    fn record_bulkhead_queue(&self, _ctx: &ExecutionContext, policy_name: &str, queued: bool) {
        self.push(MetricEvent::BulkheadQueue { policy: policy_name.to_owned(), queued });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_methods_leave_original_untouched() {
        let base = ExecutionMetrics::new("p", Duration::from_millis(3), false);
        let derived = base.with_circuit_state(CircuitState::Open).with_rate_limited(true);

        assert_eq!(base.circuit_state(), None);
        assert_eq!(base.rate_limited(), None);
        assert_eq!(derived.circuit_state(), Some(CircuitState::Open));
        assert_eq!(derived.rate_limited(), Some(true));
        assert_eq!(derived.timestamp(), base.timestamp());
    }

    #[test]
    fn with_context_copies_ids() {
        let ctx = ExecutionContext::background().with_correlation_id("c").with_trace_id("t");
        let m = ExecutionMetrics::new("p", Duration::ZERO, true).with_context(&ctx);
        assert_eq!(m.correlation_id(), Some("c"));
        assert_eq!(m.trace_id(), Some("t"));
    }

    #[test]
    fn in_memory_recorder_evicts_oldest() {
        let recorder = InMemoryMetricsRecorder::with_capacity(2);
        let ctx = ExecutionContext::background();
        recorder.record_retry_attempt(&ctx, "p", 2);
        recorder.record_retry_attempt(&ctx, "p", 3);
        recorder.record_retry_attempt(&ctx, "p", 4);

        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.evicted(), 1);
        assert_eq!(recorder.retry_attempts("p"), vec![3, 4]);
    }

    #[test]
    fn in_memory_recorder_filters_by_policy() {
        let recorder = InMemoryMetricsRecorder::new();
        let ctx = ExecutionContext::background();
        recorder.record_circuit_state(&ctx, "a", CircuitState::Open);
        recorder.record_circuit_state(&ctx, "b", CircuitState::HalfOpen);
        recorder.record_bulkhead_queue(&ctx, "a", true);

        assert_eq!(recorder.circuit_states("a"), vec![CircuitState::Open]);
        assert_eq!(recorder.circuit_states("b"), vec![CircuitState::HalfOpen]);
        assert!(recorder.events().contains(&MetricEvent::BulkheadQueue { policy: "a".into(), queued: true }));
    }

    #[test]
    fn noop_recorder_accepts_everything() {
        let ctx = ExecutionContext::background();
        let r = NoopMetricsRecorder;
        r.record_execution(&ctx, &ExecutionMetrics::new("p", Duration::ZERO, true));
        r.record_rate_limit(&ctx, "p", true);
    }
}
