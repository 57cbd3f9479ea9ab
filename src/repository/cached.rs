//! Cache-first repository decorator.
//!
//! Reads are served from a bounded LRU when possible. Writes go to the wrapped repository first
//! and only touch the cache once that write succeeded, so a failed write never leaves a value in
//! the cache that the store does not have.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::PolicyRepository;
use crate::context::ExecutionContext;
use crate::policy::Policy;
use crate::service::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of cached policies. Zero is treated as one.
    pub capacity: usize,
    /// Entries older than this are refetched. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1000, ttl: Some(Duration::from_secs(300)) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

#[derive(Debug)]
struct CacheEntry {
    policy: Policy,
    cached_at: Instant,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<String, CacheEntry>,
    // Bumped by every write. A read that started under an older epoch may have fetched a value
    // that a concurrent write already replaced, so its result is not cached.
    epoch: u64,
}

#[derive(Debug)]
pub struct CachedPolicyRepository<R> {
    inner: R,
    ttl: Option<Duration>,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<R: PolicyRepository> CachedPolicyRepository<R> {
    pub fn new(inner: R, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            ttl: config.ttl,
            state: Mutex::new(CacheState { entries: LruCache::new(capacity), epoch: 0 }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.state.lock().entries.len(),
        }
    }

    /// Drop the cached entry for `name`; the next read goes to the store.
    pub fn invalidate(&self, name: &str) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.entries.pop(name);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.entries.clear();
    }

    fn lookup(&self, name: &str) -> Result<Policy, u64> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(name) {
            Some(entry) if !self.is_expired(entry) => return Ok(entry.policy.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.pop(name);
        }
        Err(state.epoch)
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl.is_some_and(|ttl| entry.cached_at.elapsed() >= ttl)
    }

    /// Insert unless the cache already holds a newer version.
    fn store_locked(&self, state: &mut CacheState, policy: Policy) {
        if let Some(existing) = state.entries.peek(policy.name()) {
            if existing.policy.version() > policy.version() {
                return;
            }
        }
        let name = policy.name().to_string();
        let entry = CacheEntry { policy, cached_at: Instant::now() };
        if let Some((evicted, _)) = state.entries.push(name.clone(), entry) {
            if evicted != name {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl<R: PolicyRepository> PolicyRepository for CachedPolicyRepository<R> {
    async fn get(&self, ctx: &ExecutionContext, name: &str) -> Result<Option<Policy>, PolicyError> {
        let epoch = match self.lookup(name) {
            Ok(policy) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(policy));
            }
            Err(epoch) => epoch,
        };
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fetched = self.inner.get(ctx, name).await?;
        if let Some(policy) = &fetched {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                self.store_locked(&mut state, policy.clone());
            }
        }
        Ok(fetched)
    }

    async fn save(&self, ctx: &ExecutionContext, policy: Policy) -> Result<Policy, PolicyError> {
        let saved = self.inner.save(ctx, policy).await?;
        let mut state = self.state.lock();
        state.epoch += 1;
        self.store_locked(&mut state, saved.clone());
        Ok(saved)
    }

    async fn delete(&self, ctx: &ExecutionContext, name: &str) -> Result<bool, PolicyError> {
        let removed = self.inner.delete(ctx, name).await?;
        self.invalidate(name);
        Ok(removed)
    }

    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<Policy>, PolicyError> {
        self.inner.list(ctx).await
    }
}
