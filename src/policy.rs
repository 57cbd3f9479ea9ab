//! The `Policy` entity: a named, versioned bundle of optional pattern configurations.
//!
//! Every setter validates its sub-config first. On failure the policy is left exactly as it
//! was and the error names the offending field; on success the sub-config is replaced and
//! `version`/`updated_at` advance.
//!
//! ```rust
//! use std::time::Duration;
//! use resilience_runtime::policy::{CircuitBreakerConfig, Policy};
//!
//! let mut policy = Policy::new("checkout").unwrap();
//! assert!(policy.set_circuit_breaker(CircuitBreakerConfig::new(0, Duration::from_secs(30))).is_err());
//! assert_eq!(policy.version(), 1);
//!
//! policy.set_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_secs(30))).unwrap();
//! assert_eq!(policy.version(), 2);
//! ```

pub mod config;
pub mod validation;

pub use config::{
    BulkheadConfig, CircuitBreakerConfig, PolicyConfig, RateLimitAlgorithm, RateLimitConfig,
    RetryConfig, TimeoutConfig,
};

use chrono::{DateTime, Utc};

use crate::error::InvalidPolicyError;
use validation::{non_empty, Validator};

#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    name: String,
    version: u64,
    patterns: PolicyConfig,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Policy {
    /// A new policy at version 1 with no patterns enabled.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidPolicyError> {
        let name = name.into();
        Validator::new().field("name", name.as_str(), non_empty()).finish()?;
        let now = Utc::now();
        Ok(Self {
            patterns: PolicyConfig::new(name.clone()),
            name,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild a persisted policy, re-validating everything.
    pub(crate) fn restore(
        patterns: PolicyConfig,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, InvalidPolicyError> {
        patterns.validate()?;
        Ok(Self {
            name: patterns.name.clone(),
            version: version.max(1),
            patterns,
            created_at,
            updated_at: updated_at.max(created_at),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.patterns.circuit_breaker.as_ref()
    }

    pub fn retry(&self) -> Option<&RetryConfig> {
        self.patterns.retry.as_ref()
    }

    pub fn timeout(&self) -> Option<&TimeoutConfig> {
        self.patterns.timeout.as_ref()
    }

    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.patterns.rate_limit.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&BulkheadConfig> {
        self.patterns.bulkhead.as_ref()
    }

    pub fn set_circuit_breaker(
        &mut self,
        config: CircuitBreakerConfig,
    ) -> Result<&mut Self, InvalidPolicyError> {
        config.validate().map_err(|e| self.scoped(e, "circuit_breaker"))?;
        self.patterns.circuit_breaker = Some(config);
        Ok(self.touch())
    }

    pub fn set_retry(&mut self, config: RetryConfig) -> Result<&mut Self, InvalidPolicyError> {
        config.validate().map_err(|e| self.scoped(e, "retry"))?;
        self.patterns.retry = Some(config);
        Ok(self.touch())
    }

    pub fn set_timeout(&mut self, config: TimeoutConfig) -> Result<&mut Self, InvalidPolicyError> {
        config.validate().map_err(|e| self.scoped(e, "timeout"))?;
        self.patterns.timeout = Some(config);
        Ok(self.touch())
    }

    pub fn set_rate_limit(
        &mut self,
        config: RateLimitConfig,
    ) -> Result<&mut Self, InvalidPolicyError> {
        config.validate().map_err(|e| self.scoped(e, "rate_limit"))?;
        self.patterns.rate_limit = Some(config);
        Ok(self.touch())
    }

    pub fn set_bulkhead(&mut self, config: BulkheadConfig) -> Result<&mut Self, InvalidPolicyError> {
        config.validate().map_err(|e| self.scoped(e, "bulkhead"))?;
        self.patterns.bulkhead = Some(config);
        Ok(self.touch())
    }

    /// Disables the pattern. A no-op (no version bump) when it was already absent.
    pub fn clear_circuit_breaker(&mut self) -> &mut Self {
        if self.patterns.circuit_breaker.take().is_some() {
            self.touch();
        }
        self
    }

    pub fn clear_retry(&mut self) -> &mut Self {
        if self.patterns.retry.take().is_some() {
            self.touch();
        }
        self
    }

    pub fn clear_timeout(&mut self) -> &mut Self {
        if self.patterns.timeout.take().is_some() {
            self.touch();
        }
        self
    }

    pub fn clear_rate_limit(&mut self) -> &mut Self {
        if self.patterns.rate_limit.take().is_some() {
            self.touch();
        }
        self
    }

    pub fn clear_bulkhead(&mut self) -> &mut Self {
        if self.patterns.bulkhead.take().is_some() {
            self.touch();
        }
        self
    }

    pub fn has_any_pattern(&self) -> bool {
        self.patterns.has_any_pattern()
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        self.patterns.validate()
    }

    /// The executor-facing view of this policy.
    pub fn to_config(&self) -> PolicyConfig {
        self.patterns.clone()
    }

    /// Same patterns, ignoring version and timestamps.
    pub fn same_patterns(&self, other: &Policy) -> bool {
        self.patterns == other.patterns
    }

    pub(crate) fn mark_created(&mut self, at: DateTime<Utc>) {
        self.version = 1;
        self.created_at = at;
        self.updated_at = at;
    }

    /// Pin the persisted version after an update.
    pub(crate) fn stamp(&mut self, version: u64, at: DateTime<Utc>) {
        self.version = version;
        self.updated_at = at.max(self.created_at);
    }

    fn touch(&mut self) -> &mut Self {
        self.version = self.version.saturating_add(1);
        self.updated_at = Utc::now().max(self.updated_at);
        self
    }

    fn scoped(&self, err: InvalidPolicyError, prefix: &str) -> InvalidPolicyError {
        err.prefixed(prefix).for_policy(self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_name_is_rejected() {
        assert_eq!(Policy::new("  ").unwrap_err().field(), "name");
    }

    #[test]
    fn invalid_setter_leaves_policy_untouched() {
        let mut policy = Policy::new("p").unwrap();
        policy.set_retry(RetryConfig::default()).unwrap();
        let before = policy.clone();

        let err = policy
            .set_retry(RetryConfig::new(0, Duration::from_millis(10), Duration::from_secs(1)))
            .unwrap_err();

        assert_eq!(err.field(), "retry.max_attempts");
        assert_eq!(err.policy(), Some("p"));
        assert_eq!(policy, before);
    }

    #[test]
    fn each_successful_setter_bumps_version_once() {
        let mut policy = Policy::new("p").unwrap();
        policy
            .set_timeout(TimeoutConfig::new(Duration::from_secs(2)))
            .unwrap()
            .set_bulkhead(BulkheadConfig::new(4, 0))
            .unwrap();
        assert_eq!(policy.version(), 3);
        assert!(policy.updated_at() >= policy.created_at());
    }

    #[test]
    fn clearing_absent_pattern_does_not_bump() {
        let mut policy = Policy::new("p").unwrap();
        policy.clear_rate_limit();
        assert_eq!(policy.version(), 1);

        policy.set_rate_limit(RateLimitConfig::sliding_window(5, Duration::from_secs(1))).unwrap();
        policy.clear_rate_limit();
        assert_eq!(policy.version(), 3);
        assert!(policy.rate_limit().is_none());
        assert!(!policy.has_any_pattern());
    }

    #[test]
    fn to_config_carries_every_pattern() {
        let mut policy = Policy::new("orders").unwrap();
        policy.set_circuit_breaker(CircuitBreakerConfig::default()).unwrap();
        let cfg = policy.to_config();
        assert_eq!(cfg.name, "orders");
        assert_eq!(cfg.circuit_breaker, Some(CircuitBreakerConfig::default()));
        assert!(cfg.retry.is_none());
    }
}
