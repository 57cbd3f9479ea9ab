//! JSON encoding of persisted policies.
//!
//! Durations are stored as integer nanoseconds in `*_ns` fields, so every duration that
//! validates is stored exactly and the stored form is unambiguous for other readers. Every record carries `schema_version`; decoding re-validates
//! the whole policy, so a hand-edited or corrupted record never becomes a live policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidPolicyError;
use crate::policy::{
    BulkheadConfig, CircuitBreakerConfig, Policy, PolicyConfig, RateLimitConfig, RetryConfig,
    TimeoutConfig,
};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed policy record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported policy record schema version {0} (expected {SCHEMA_VERSION})")]
    UnsupportedSchema(u32),
    #[error("stored policy is invalid: {0}")]
    Invalid(#[from] InvalidPolicyError),
    #[error("{field} = {value:?} does not fit in u64 nanoseconds")]
    DurationOverflow { field: &'static str, value: Duration },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PolicyRecord {
    schema_version: u32,
    name: String,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    circuit_breaker: Option<CircuitBreakerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<TimeoutRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bulkhead: Option<BulkheadRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CircuitBreakerRecord {
    failure_threshold: u32,
    success_threshold: u32,
    timeout_ns: u64,
    half_open_max_calls: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RetryRecord {
    max_attempts: u32,
    base_delay_ns: u64,
    max_delay_ns: u64,
    multiplier: f64,
    jitter_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TimeoutRecord {
    default_ns: u64,
    max_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RateLimitRecord {
    algorithm: String,
    limit: u32,
    window_ns: u64,
    burst_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BulkheadRecord {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout_ns: u64,
}

fn nanos(field: &'static str, value: Duration) -> Result<u64, CodecError> {
    u64::try_from(value.as_nanos()).map_err(|_| CodecError::DurationOverflow { field, value })
}

pub fn encode(policy: &Policy) -> Result<Vec<u8>, CodecError> {
    let circuit_breaker = match policy.circuit_breaker() {
        Some(c) => Some(CircuitBreakerRecord {
            failure_threshold: c.failure_threshold,
            success_threshold: c.success_threshold,
            timeout_ns: nanos("circuit_breaker.timeout", c.timeout)?,
            half_open_max_calls: c.half_open_max_calls,
        }),
        None => None,
    };
    let retry = match policy.retry() {
        Some(c) => Some(RetryRecord {
            max_attempts: c.max_attempts,
            base_delay_ns: nanos("retry.base_delay", c.base_delay)?,
            max_delay_ns: nanos("retry.max_delay", c.max_delay)?,
            multiplier: c.multiplier,
            jitter_percent: c.jitter_percent,
        }),
        None => None,
    };
    let timeout = match policy.timeout() {
        Some(c) => Some(TimeoutRecord {
            default_ns: nanos("timeout.default", c.default)?,
            max_ns: nanos("timeout.max", c.max)?,
        }),
        None => None,
    };
    let rate_limit = match policy.rate_limit() {
        Some(c) => Some(RateLimitRecord {
            algorithm: c.algorithm.as_str().to_string(),
            limit: c.limit,
            window_ns: nanos("rate_limit.window", c.window)?,
            burst_size: c.burst_size,
        }),
        None => None,
    };
    let bulkhead = match policy.bulkhead() {
        Some(c) => Some(BulkheadRecord {
            max_concurrent: c.max_concurrent,
            max_queue: c.max_queue,
            queue_timeout_ns: nanos("bulkhead.queue_timeout", c.queue_timeout)?,
        }),
        None => None,
    };

    let record = PolicyRecord {
        schema_version: SCHEMA_VERSION,
        name: policy.name().to_string(),
        version: policy.version(),
        created_at: policy.created_at(),
        updated_at: policy.updated_at(),
        circuit_breaker,
        retry,
        timeout,
        rate_limit,
        bulkhead,
    };
    Ok(serde_json::to_vec(&record)?)
}

pub fn decode(bytes: &[u8]) -> Result<Policy, CodecError> {
    let record: PolicyRecord = serde_json::from_slice(bytes)?;
    if record.schema_version != SCHEMA_VERSION {
        return Err(CodecError::UnsupportedSchema(record.schema_version));
    }

    let rate_limit = match record.rate_limit {
        Some(r) => Some(RateLimitConfig {
            algorithm: r.algorithm.parse().map_err(|e: InvalidPolicyError| e.prefixed("rate_limit"))?,
            limit: r.limit,
            window: Duration::from_nanos(r.window_ns),
            burst_size: r.burst_size,
        }),
        None => None,
    };

    let patterns = PolicyConfig {
        name: record.name,
        circuit_breaker: record.circuit_breaker.map(|r| CircuitBreakerConfig {
            failure_threshold: r.failure_threshold,
            success_threshold: r.success_threshold,
            timeout: Duration::from_nanos(r.timeout_ns),
            half_open_max_calls: r.half_open_max_calls,
        }),
        retry: record.retry.map(|r| RetryConfig {
            max_attempts: r.max_attempts,
            base_delay: Duration::from_nanos(r.base_delay_ns),
            max_delay: Duration::from_nanos(r.max_delay_ns),
            multiplier: r.multiplier,
            jitter_percent: r.jitter_percent,
        }),
        timeout: record.timeout.map(|r| TimeoutConfig {
            default: Duration::from_nanos(r.default_ns),
            max: Duration::from_nanos(r.max_ns),
        }),
        rate_limit,
        bulkhead: record.bulkhead.map(|r| BulkheadConfig {
            max_concurrent: r.max_concurrent,
            max_queue: r.max_queue,
            queue_timeout: Duration::from_nanos(r.queue_timeout_ns),
        }),
    };

    Ok(Policy::restore(patterns, record.version, record.created_at, record.updated_at)?)
}
