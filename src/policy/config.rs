//! Sub-configurations for each resilience pattern and the [`PolicyConfig`] bundle the executor
//! runs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::validation::{at_least, between, finite, non_empty, positive, Rule, Validator};
use crate::backoff::Backoff;
use crate::error::InvalidPolicyError;
use crate::jitter::Jitter;

/// Breaker open-state duration bounds.
pub const MIN_BREAKER_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_BREAKER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// Successful probes in HalfOpen that close it again.
    pub success_threshold: u32,
    /// Time spent Open before probes are admitted.
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self { failure_threshold, timeout, ..Self::default() }
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        Validator::new()
            .field("failure_threshold", &self.failure_threshold, at_least(1u32))
            .field("success_threshold", &self.success_threshold, at_least(1u32))
            .field("timeout", &self.timeout, between(MIN_BREAKER_TIMEOUT, MAX_BREAKER_TIMEOUT))
            .field("half_open_max_calls", &self.half_open_max_calls, at_least(1u32))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction in `0.0..=1.0` applied as ± jitter.
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay, ..Self::default() }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_percent = fraction;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(self.base_delay)
            .with_multiplier(self.multiplier)
            .with_max(self.max_delay)
    }

    pub fn jitter(&self) -> Jitter {
        Jitter::proportional(self.jitter_percent)
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        Validator::new()
            .field("max_attempts", &self.max_attempts, at_least(1u32))
            .field("base_delay", &self.base_delay, positive())
            .field("max_delay", &self.max_delay, positive())
            .ensure(
                self.max_delay >= self.base_delay,
                "max_delay",
                format!("{:?}", self.max_delay),
                format!(">= base_delay ({:?})", self.base_delay),
            )
            .field("multiplier", &self.multiplier, finite().and(at_least(1.0)))
            .field("jitter_percent", &self.jitter_percent, finite().and(between(0.0, 1.0)))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

impl RateLimitAlgorithm {
    pub const NAMES: &'static [&'static str] = &["token_bucket", "sliding_window"];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitAlgorithm {
    type Err = InvalidPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(InvalidPolicyError::single(
                "algorithm",
                format!("{other:?}"),
                "one of token_bucket|sliding_window",
            )),
        }
    }
}

/// `burst_size` is not checked against `limit`: a bucket may hold more than one
/// window's worth of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    /// Admissions per `window`.
    pub limit: u32,
    pub window: Duration,
    /// Token bucket capacity. Unused by the sliding window.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limit: 100,
            window: Duration::from_secs(1),
            burst_size: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn token_bucket(limit: u32, window: Duration, burst_size: u32) -> Self {
        Self { algorithm: RateLimitAlgorithm::TokenBucket, limit, window, burst_size }
    }

    pub fn sliding_window(limit: u32, window: Duration) -> Self {
        Self { algorithm: RateLimitAlgorithm::SlidingWindow, limit, window, burst_size: limit }
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        Validator::new()
            .field("limit", &self.limit, positive())
            .field("window", &self.window, positive())
            .field("burst_size", &self.burst_size, positive())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot. Zero disables queueing.
    pub max_queue: usize,
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, max_queue: 10, queue_timeout: Duration::from_secs(1) }
    }
}

impl BulkheadConfig {
    pub fn new(max_concurrent: usize, max_queue: usize) -> Self {
        Self { max_concurrent, max_queue, ..Self::default() }
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        let mut v = Validator::new().field("max_concurrent", &self.max_concurrent, positive());
        if self.max_queue > 0 {
            v = v.field("queue_timeout", &self.queue_timeout, positive());
        }
        v.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub default: Duration,
    /// Upper bound for caller-requested timeouts.
    pub max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { default: Duration::from_secs(30), max: Duration::from_secs(60) }
    }
}

impl TimeoutConfig {
    /// `max` equals `default`.
    pub fn new(default: Duration) -> Self {
        Self { default, max: default }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        Validator::new()
            .field("default", &self.default, positive())
            .ensure(
                self.max >= self.default,
                "max",
                format!("{:?}", self.max),
                format!(">= default ({:?})", self.default),
            )
            .finish()
    }
}

/// Everything the executor needs to run calls under one policy name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyConfig {
    pub name: String,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub bulkhead: Option<BulkheadConfig>,
}

impl PolicyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn has_any_pattern(&self) -> bool {
        self.circuit_breaker.is_some()
            || self.retry.is_some()
            || self.timeout.is_some()
            || self.rate_limit.is_some()
            || self.bulkhead.is_some()
    }

    /// Validates the name and every present sub-config, reporting all violations at once.
    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        Validator::new()
            .field("name", self.name.as_str(), non_empty())
            .nested("circuit_breaker", self.circuit_breaker.as_ref().map_or(Ok(()), |c| c.validate()))
            .nested("retry", self.retry.as_ref().map_or(Ok(()), |c| c.validate()))
            .nested("timeout", self.timeout.as_ref().map_or(Ok(()), |c| c.validate()))
            .nested("rate_limit", self.rate_limit.as_ref().map_or(Ok(()), |c| c.validate()))
            .nested("bulkhead", self.bulkhead.as_ref().map_or(Ok(()), |c| c.validate()))
            .finish()
            .map_err(|e| e.for_policy(self.name.clone()))
    }
}
