//! Convenient re-exports for common resilience-runtime types.
pub use crate::{
    bulkhead::Bulkhead,
    circuit_breaker::{CircuitBreaker, CircuitState},
    context::{ContextError, ExecutionContext},
    error::{InvalidPolicyError, ResilienceError},
    events::{EventPublisher, InMemoryEventPublisher, PolicyEvent, PolicyEventKind},
    executor::ResilienceExecutor,
    policy::{
        BulkheadConfig, CircuitBreakerConfig, Policy, PolicyConfig, RateLimitConfig, RetryConfig,
        TimeoutConfig,
    },
    rate_limit::RateLimiter,
    repository::{
        CacheConfig, CachedPolicyRepository, InMemoryPolicyStore, PolicyRepository,
        StorePolicyRepository,
    },
    retry::RetryExecutor,
    service::{PolicyError, PolicyService},
    timeout::TimeoutPolicy,
};
