//! Error taxonomy shared by every resilience pattern.
//!
//! Each rejection or failure produced by a pattern is a dedicated struct carrying an
//! [`ErrorMeta`] (stable code, owning service, pattern, correlation id, timestamp). They are
//! collected in [`ResilienceError`], which also wraps the application's own error type in
//! [`ResilienceError::Inner`]. The executor never rewrites one kind into another, so matching
//! on the variant works at any depth.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::context::{ContextError, ExecutionContext};

/// Cap the number of stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CircuitOpen,
    RateLimitExceeded,
    Timeout,
    BulkheadFull,
    RetryExhausted,
    InvalidPolicy,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::BulkheadFull => "BULKHEAD_FULL",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::InvalidPolicy => "INVALID_POLICY",
        }
    }

    /// Name of the pattern that produces this code.
    pub const fn pattern(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_breaker",
            Self::RateLimitExceeded => "rate_limiter",
            Self::Timeout => "timeout",
            Self::BulkheadFull => "bulkhead",
            Self::RetryExhausted => "retry",
            Self::InvalidPolicy => "policy",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to every pattern error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMeta {
    pub code: ErrorCode,
    /// Policy or service the failing pattern belongs to.
    pub service: Option<String>,
    pub pattern: &'static str,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorMeta {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            service: None,
            pattern: code.pattern(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Copy the correlation id from `ctx`, if it has one.
    pub fn in_context(mut self, ctx: &ExecutionContext) -> Self {
        if let Some(id) = ctx.correlation_id() {
            self.correlation_id = Some(id.to_owned());
        }
        self
    }

    fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or("unnamed")
    }
}

/// Rejected because the circuit is open (or half-open with every probe slot taken).
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitOpenError {
    pub meta: ErrorMeta,
    pub opened_at: DateTime<Utc>,
    /// How long until the breaker admits a probe. Zero while probes are in flight.
    pub reset_after: Duration,
    /// Share of failed calls observed in the closed period that led to opening, 0.0 to 1.0.
    pub failure_rate: f64,
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "circuit breaker '{}' is open (failure rate {:.1}%, retry after {:?})",
            self.meta.service_name(),
            self.failure_rate * 100.0,
            self.reset_after
        )
    }
}

impl std::error::Error for CircuitOpenError {}

/// Rejected by a rate limiter. Never queued.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitError {
    pub meta: ErrorMeta,
    pub limit: u32,
    pub window: Duration,
    pub retry_after: Duration,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate limit exceeded for '{}' ({} per {:?}, retry after {:?})",
            self.meta.service_name(),
            self.limit,
            self.window,
            self.retry_after
        )
    }
}

impl std::error::Error for RateLimitError {}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutError {
    pub meta: ErrorMeta,
    pub timeout: Duration,
    pub elapsed: Duration,
    pub cause: Option<ContextError>,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out after {:?} (limit: {:?})", self.elapsed, self.timeout)
    }
}

impl std::error::Error for TimeoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

/// Rejected because every concurrency slot and queue position was taken, or the queue wait
/// ran past `QueueTimeout`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadFullError {
    pub meta: ErrorMeta,
    pub max_concurrent: usize,
    pub queue_size: usize,
    /// Running plus queued calls when the rejection happened.
    pub current_load: usize,
}

impl fmt::Display for BulkheadFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bulkhead '{}' rejected request ({} in use, max {} concurrent + {} queued)",
            self.meta.service_name(),
            self.current_load,
            self.max_concurrent,
            self.queue_size
        )
    }
}

impl std::error::Error for BulkheadFullError {}

/// Every retry attempt failed.
#[derive(Debug, Clone)]
pub struct RetryExhaustedError<E> {
    pub meta: ErrorMeta,
    pub attempts: usize,
    pub total_time: Duration,
    last_errors: Arc<Vec<ResilienceError<E>>>,
}

impl<E> RetryExhaustedError<E> {
    /// Keeps only the most recent `MAX_RETRY_FAILURES` failures.
    pub fn new(
        meta: ErrorMeta,
        attempts: usize,
        total_time: Duration,
        failures: impl IntoIterator<Item = ResilienceError<E>>,
    ) -> Self {
        let mut failures: Vec<_> = failures.into_iter().collect();
        if failures.len() > MAX_RETRY_FAILURES {
            failures.drain(..failures.len() - MAX_RETRY_FAILURES);
        }
        Self { meta, attempts, total_time, last_errors: Arc::new(failures) }
    }

    /// Recorded failures, oldest first.
    pub fn last_errors(&self) -> &[ResilienceError<E>] {
        &self.last_errors
    }

    /// The failure of the final attempt.
    pub fn last_error(&self) -> Option<&ResilienceError<E>> {
        self.last_errors.last()
    }
}

impl<E: fmt::Display> fmt::Display for RetryExhaustedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recorded = self.last_errors.len();
        let truncated_note = if recorded < self.attempts {
            format!(" (recorded last {} failures)", recorded)
        } else {
            String::new()
        };
        match self.last_errors.last() {
            Some(last) => write!(
                f,
                "retry exhausted after {} attempts in {:?}{}; last error: {}",
                self.attempts, self.total_time, truncated_note, last
            ),
            None => write!(
                f,
                "retry exhausted after {} attempts in {:?}{}; no recorded failures",
                self.attempts, self.total_time, truncated_note
            ),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryExhaustedError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_errors.last().map(|e| e as &dyn std::error::Error)
    }
}

/// A single failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub value: String,
    pub expected: String,
}

impl FieldViolation {
    pub fn new(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self { field: field.into(), value: value.into(), expected: expected.into() }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} (expected {})", self.field, self.value, self.expected)
    }
}

/// A policy or sub-configuration failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidPolicyError {
    pub meta: ErrorMeta,
    policy: Option<String>,
    violations: Vec<FieldViolation>,
}

impl InvalidPolicyError {
    pub fn new(violations: Vec<FieldViolation>) -> Self {
        Self { meta: ErrorMeta::new(ErrorCode::InvalidPolicy), policy: None, violations }
    }

    pub fn single(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::new(vec![FieldViolation::new(field, value, expected)])
    }

    pub fn for_policy(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.meta.service = Some(name.clone());
        self.policy = Some(name);
        self
    }

    /// Scope every field name under `prefix`, e.g. `retry.max_attempts`.
    pub fn prefixed(mut self, prefix: &str) -> Self {
        for v in &mut self.violations {
            v.field = format!("{prefix}.{}", v.field);
        }
        self
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    /// Field of the first violation.
    pub fn field(&self) -> &str {
        self.violations.first().map_or("", |v| v.field.as_str())
    }

    pub fn value(&self) -> &str {
        self.violations.first().map_or("", |v| v.value.as_str())
    }

    pub fn expected(&self) -> &str {
        self.violations.first().map_or("", |v| v.expected.as_str())
    }
}

impl fmt::Display for InvalidPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.policy {
            Some(name) => write!(f, "invalid policy '{name}'")?,
            None => f.write_str("invalid policy")?,
        }
        let mut violations = self.violations.iter();
        if let Some(first) = violations.next() {
            write!(f, ": {first}")?;
        }
        for v in violations {
            write!(f, "; {v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for InvalidPolicyError {}

/// Unified error type for every resilience pattern.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    CircuitOpen(CircuitOpenError),
    RateLimited(RateLimitError),
    Timeout(TimeoutError),
    BulkheadFull(BulkheadFullError),
    RetryExhausted(RetryExhaustedError<E>),
    InvalidPolicy(InvalidPolicyError),
    /// No policy is registered under this name.
    PolicyNotFound { name: String },
    /// The caller's context was cancelled or its deadline passed.
    Context(ContextError),
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen(e) => e.fmt(f),
            Self::RateLimited(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::BulkheadFull(e) => e.fmt(f),
            Self::RetryExhausted(e) => e.fmt(f),
            Self::InvalidPolicy(e) => e.fmt(f),
            Self::PolicyNotFound { name } => write!(f, "policy '{name}' is not registered"),
            Self::Context(e) => e.fmt(f),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted(e) => e.last_error().map(|e| e as &dyn std::error::Error),
            Self::Timeout(e) => e.cause.as_ref().map(|c| c as &dyn std::error::Error),
            _ => None,
        }
    }
}

impl<E> From<ContextError> for ResilienceError<E> {
    fn from(err: ContextError) -> Self {
        Self::Context(err)
    }
}

impl<E> From<InvalidPolicyError> for ResilienceError<E> {
    fn from(err: InvalidPolicyError) -> Self {
        Self::InvalidPolicy(err)
    }
}

impl<E> ResilienceError<E> {
    /// Stable code for pattern errors. `None` for application, context and lookup errors.
    pub fn code(&self) -> Option<ErrorCode> {
        self.meta().map(|m| m.code)
    }

    pub fn meta(&self) -> Option<&ErrorMeta> {
        match self {
            Self::CircuitOpen(e) => Some(&e.meta),
            Self::RateLimited(e) => Some(&e.meta),
            Self::Timeout(e) => Some(&e.meta),
            Self::BulkheadFull(e) => Some(&e.meta),
            Self::RetryExhausted(e) => Some(&e.meta),
            Self::InvalidPolicy(e) => Some(&e.meta),
            Self::PolicyNotFound { .. } | Self::Context(_) | Self::Inner(_) => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull(_))
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted(_))
    }

    pub fn is_invalid_policy(&self) -> bool {
        matches!(self, Self::InvalidPolicy(_))
    }

    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Context(e) => Some(*e),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts and recorded failure count for `RetryExhausted`.
    pub fn retry_exhausted_info(&self) -> Option<(usize, usize)> {
        match self {
            Self::RetryExhausted(e) => Some((e.attempts, e.last_errors().len())),
            _ => None,
        }
    }
}
