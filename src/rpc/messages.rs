//! Request and response messages for the policy RPCs.
//!
//! Sub-config messages mirror the policy model field for field. Durations travel as
//! [`Duration`] values, never as bare integers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidPolicyError;
use crate::events::{PolicyEvent, PolicyEventKind};
use crate::policy::{
    BulkheadConfig, CircuitBreakerConfig, Policy, RateLimitConfig, RetryConfig, TimeoutConfig,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerMessage {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl From<&CircuitBreakerConfig> for CircuitBreakerMessage {
    fn from(c: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            success_threshold: c.success_threshold,
            timeout: c.timeout,
            half_open_max_calls: c.half_open_max_calls,
        }
    }
}

impl From<&CircuitBreakerMessage> for CircuitBreakerConfig {
    fn from(m: &CircuitBreakerMessage) -> Self {
        Self {
            failure_threshold: m.failure_threshold,
            success_threshold: m.success_threshold,
            timeout: m.timeout,
            half_open_max_calls: m.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMessage {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_percent: f64,
}

impl From<&RetryConfig> for RetryMessage {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            base_delay: c.base_delay,
            max_delay: c.max_delay,
            multiplier: c.multiplier,
            jitter_percent: c.jitter_percent,
        }
    }
}

impl From<&RetryMessage> for RetryConfig {
    fn from(m: &RetryMessage) -> Self {
        Self {
            max_attempts: m.max_attempts,
            base_delay: m.base_delay,
            max_delay: m.max_delay,
            multiplier: m.multiplier,
            jitter_percent: m.jitter_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutMessage {
    pub default: Duration,
    pub max: Duration,
}

impl From<&TimeoutConfig> for TimeoutMessage {
    fn from(c: &TimeoutConfig) -> Self {
        Self { default: c.default, max: c.max }
    }
}

impl From<&TimeoutMessage> for TimeoutConfig {
    fn from(m: &TimeoutMessage) -> Self {
        Self { default: m.default, max: m.max }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitMessage {
    /// `token_bucket` or `sliding_window`.
    pub algorithm: String,
    pub limit: u32,
    pub window: Duration,
    pub burst_size: u32,
}

impl From<&RateLimitConfig> for RateLimitMessage {
    fn from(c: &RateLimitConfig) -> Self {
        Self {
            algorithm: c.algorithm.as_str().to_string(),
            limit: c.limit,
            window: c.window,
            burst_size: c.burst_size,
        }
    }
}

impl TryFrom<&RateLimitMessage> for RateLimitConfig {
    type Error = InvalidPolicyError;

    fn try_from(m: &RateLimitMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            algorithm: m.algorithm.parse().map_err(|e: InvalidPolicyError| e.prefixed("rate_limit"))?,
            limit: m.limit,
            window: m.window,
            burst_size: m.burst_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadMessage {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub queue_timeout: Duration,
}

impl From<&BulkheadConfig> for BulkheadMessage {
    fn from(c: &BulkheadConfig) -> Self {
        Self { max_concurrent: c.max_concurrent, max_queue: c.max_queue, queue_timeout: c.queue_timeout }
    }
}

impl From<&BulkheadMessage> for BulkheadConfig {
    fn from(m: &BulkheadMessage) -> Self {
        Self { max_concurrent: m.max_concurrent, max_queue: m.max_queue, queue_timeout: m.queue_timeout }
    }
}

/// The pattern part of a policy. An absent field disables that pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyPatterns {
    pub circuit_breaker: Option<CircuitBreakerMessage>,
    pub retry: Option<RetryMessage>,
    pub timeout: Option<TimeoutMessage>,
    pub rate_limit: Option<RateLimitMessage>,
    pub bulkhead: Option<BulkheadMessage>,
}

impl PolicyPatterns {
    /// Make `policy` carry exactly these patterns, through its validating setters.
    ///
    /// Stops at the first invalid sub-config. Callers that need all-or-nothing apply this to a
    /// copy.
    pub fn apply_to(&self, policy: &mut Policy) -> Result<(), InvalidPolicyError> {
        match &self.circuit_breaker {
            Some(m) => {
                policy.set_circuit_breaker(m.into())?;
            }
            None => {
                policy.clear_circuit_breaker();
            }
        }
        match &self.retry {
            Some(m) => {
                policy.set_retry(m.into())?;
            }
            None => {
                policy.clear_retry();
            }
        }
        match &self.timeout {
            Some(m) => {
                policy.set_timeout(m.into())?;
            }
            None => {
                policy.clear_timeout();
            }
        }
        match &self.rate_limit {
            Some(m) => {
                policy.set_rate_limit(m.try_into()?)?;
            }
            None => {
                policy.clear_rate_limit();
            }
        }
        match &self.bulkhead {
            Some(m) => {
                policy.set_bulkhead(m.into())?;
            }
            None => {
                policy.clear_bulkhead();
            }
        }
        Ok(())
    }
}

impl From<&Policy> for PolicyPatterns {
    fn from(p: &Policy) -> Self {
        Self {
            circuit_breaker: p.circuit_breaker().map(Into::into),
            retry: p.retry().map(Into::into),
            timeout: p.timeout().map(Into::into),
            rate_limit: p.rate_limit().map(Into::into),
            bulkhead: p.bulkhead().map(Into::into),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMessage {
    pub name: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub patterns: PolicyPatterns,
}

impl From<&Policy> for PolicyMessage {
    fn from(p: &Policy) -> Self {
        Self {
            name: p.name().to_string(),
            version: p.version(),
            created_at: p.created_at(),
            updated_at: p.updated_at(),
            patterns: p.into(),
        }
    }
}

impl From<Policy> for PolicyMessage {
    fn from(p: Policy) -> Self {
        Self::from(&p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePolicyRequest {
    pub name: String,
    #[serde(default, flatten)]
    pub patterns: PolicyPatterns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePolicyResponse {
    pub policy: PolicyMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPolicyRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPolicyResponse {
    pub policy: PolicyMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicyRequest {
    pub name: String,
    /// When set, the update only applies if the stored version still matches.
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(default, flatten)]
    pub patterns: PolicyPatterns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicyResponse {
    pub policy: PolicyMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePolicyRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePolicyResponse {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPoliciesRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPoliciesResponse {
    pub policies: Vec<PolicyMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchPoliciesRequest {
    /// Empty watches every policy.
    #[serde(default)]
    pub policy_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEventMessage {
    pub event_id: String,
    pub kind: PolicyEventKind,
    pub policy_name: String,
    pub version: u64,
    pub occurred_at: DateTime<Utc>,
}

impl From<PolicyEvent> for PolicyEventMessage {
    fn from(e: PolicyEvent) -> Self {
        Self {
            event_id: e.id.to_string(),
            kind: e.kind,
            policy_name: e.policy_name,
            version: e.version,
            occurred_at: e.occurred_at,
        }
    }
}
