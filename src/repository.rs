//! Policy persistence.
//!
//! - [`PolicyRepository`]: get/save/delete/list of whole [`Policy`] values.
//! - [`StorePolicyRepository`]: repository over any key-value [`PolicyStore`], storing each
//!   policy as a JSON record under `<prefix><name>`.
//! - [`CachedPolicyRepository`]: cache-first LRU decorator for any repository.
//!
//! `save` is optimistic: it fails with [`PolicyError::VersionConflict`] unless the incoming
//! version is strictly newer than the stored one.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::policy::Policy;
use crate::service::PolicyError;

pub mod cached;
pub mod codec;
pub mod store;

pub use cached::{CacheConfig, CacheStats, CachedPolicyRepository};
pub use codec::CodecError;
pub use store::{InMemoryPolicyStore, PolicyStore, StoreError};

/// Default key prefix for policy records.
pub const DEFAULT_KEY_PREFIX: &str = "policy:";

#[async_trait]
pub trait PolicyRepository: Send + Sync + fmt::Debug {
    async fn get(&self, ctx: &ExecutionContext, name: &str) -> Result<Option<Policy>, PolicyError>;

    /// Persist `policy` and return what was stored.
    async fn save(&self, ctx: &ExecutionContext, policy: Policy) -> Result<Policy, PolicyError>;

    /// Returns whether a policy was removed.
    async fn delete(&self, ctx: &ExecutionContext, name: &str) -> Result<bool, PolicyError>;

    /// Every stored policy, sorted by name.
    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<Policy>, PolicyError>;
}

#[async_trait]
impl<R: PolicyRepository + ?Sized> PolicyRepository for Arc<R> {
    async fn get(&self, ctx: &ExecutionContext, name: &str) -> Result<Option<Policy>, PolicyError> {
        (**self).get(ctx, name).await
    }

    async fn save(&self, ctx: &ExecutionContext, policy: Policy) -> Result<Policy, PolicyError> {
        (**self).save(ctx, policy).await
    }

    async fn delete(&self, ctx: &ExecutionContext, name: &str) -> Result<bool, PolicyError> {
        (**self).delete(ctx, name).await
    }

    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<Policy>, PolicyError> {
        (**self).list(ctx).await
    }
}

#[derive(Debug)]
pub struct StorePolicyRepository {
    store: Arc<dyn PolicyStore>,
    prefix: String,
    // Serializes the read-compare-write in `save` and `delete`.
    write_lock: tokio::sync::Mutex<()>,
}

impl StorePolicyRepository {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn PolicyStore>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into(), write_lock: tokio::sync::Mutex::new(()) }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    async fn load(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<Policy>, PolicyError> {
        match ctx.run(self.store.get(key)).await?? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PolicyRepository for StorePolicyRepository {
    async fn get(&self, ctx: &ExecutionContext, name: &str) -> Result<Option<Policy>, PolicyError> {
        self.load(ctx, &self.key(name)).await
    }

    async fn save(&self, ctx: &ExecutionContext, policy: Policy) -> Result<Policy, PolicyError> {
        policy.validate()?;
        let key = self.key(policy.name());
        let bytes = codec::encode(&policy)?;

        let _guard = ctx.run(self.write_lock.lock()).await?;
        if let Some(stored) = self.load(ctx, &key).await? {
            if stored.version() >= policy.version() {
                return Err(PolicyError::VersionConflict {
                    name: policy.name().to_string(),
                    stored: stored.version(),
                    attempted: policy.version(),
                });
            }
        }
        // Once the write starts it is not abandoned half-way on cancellation.
        ctx.check()?;
        self.store.put(&key, bytes).await?;
        tracing::debug!(policy = %policy.name(), version = policy.version(), "stored policy");
        Ok(policy)
    }

    async fn delete(&self, ctx: &ExecutionContext, name: &str) -> Result<bool, PolicyError> {
        let _guard = ctx.run(self.write_lock.lock()).await?;
        ctx.check()?;
        Ok(self.store.delete(&self.key(name)).await?)
    }

    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<Policy>, PolicyError> {
        let entries = ctx.run(self.store.list(&self.prefix)).await??;
        let mut policies = entries
            .iter()
            .map(|(_, bytes)| codec::decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        policies.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(policies)
    }
}
