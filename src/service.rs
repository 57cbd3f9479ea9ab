//! Policy management: validated CRUD over a [`PolicyRepository`] plus lifecycle events.
//!
//! Every mutation validates before it persists, so a rejected change leaves the stored policy
//! exactly as it was. After a successful write the service publishes a [`PolicyEvent`]; a
//! publish failure is logged and does not undo the write.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;

use crate::context::{ContextError, ExecutionContext};
use crate::error::InvalidPolicyError;
use crate::events::{EventPublisher, PolicyEvent, SubscriptionId};
use crate::policy::Policy;
use crate::repository::{CodecError, PolicyRepository, StoreError};

/// Default capacity of a watch buffer.
pub const DEFAULT_WATCH_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy '{name}' not found")]
    NotFound { name: String },
    #[error("policy '{name}' already exists")]
    AlreadyExists { name: String },
    #[error(transparent)]
    Invalid(#[from] InvalidPolicyError),
    #[error("policy '{name}' version conflict: stored version is {stored}, attempted {attempted}")]
    VersionConflict { name: String, stored: u64, attempted: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Clone)]
pub struct PolicyService {
    repository: Arc<dyn PolicyRepository>,
    publisher: Arc<dyn EventPublisher>,
    watch_buffer: usize,
}

impl PolicyService {
    pub fn new(repository: Arc<dyn PolicyRepository>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { repository, publisher, watch_buffer: DEFAULT_WATCH_BUFFER }
    }

    pub fn with_watch_buffer(mut self, buffer: usize) -> Self {
        self.watch_buffer = buffer.max(1);
        self
    }

    /// Create an empty policy (no patterns enabled) at version 1.
    pub async fn create_policy(&self, ctx: &ExecutionContext, name: &str) -> Result<Policy, PolicyError> {
        self.create_configured_policy(ctx, Policy::new(name)?).await
    }

    /// Create a policy with its patterns already set. It is stored at version 1 whatever
    /// version the setters reached.
    pub async fn create_configured_policy(
        &self,
        ctx: &ExecutionContext,
        mut policy: Policy,
    ) -> Result<Policy, PolicyError> {
        policy.validate()?;
        let name = policy.name().to_string();
        if self.repository.get(ctx, &name).await?.is_some() {
            return Err(PolicyError::AlreadyExists { name });
        }

        policy.mark_created(Utc::now());
        let created = match self.repository.save(ctx, policy).await {
            Err(PolicyError::VersionConflict { .. }) => return Err(PolicyError::AlreadyExists { name }),
            other => other?,
        };
        tracing::info!(policy = %created.name(), version = created.version(), "policy created");
        self.publish(ctx, PolicyEvent::created(&created)).await;
        Ok(created)
    }

    pub async fn get_policy(&self, ctx: &ExecutionContext, name: &str) -> Result<Option<Policy>, PolicyError> {
        self.repository.get(ctx, name).await
    }

    /// Replace a stored policy with `policy`.
    ///
    /// `policy` must have been derived from the stored one: its version has to be newer than
    /// the stored version, which is what applying at least one setter to a fetched copy gives.
    /// The result is persisted as `stored.version + 1`.
    pub async fn update_policy(&self, ctx: &ExecutionContext, mut policy: Policy) -> Result<Policy, PolicyError> {
        policy.validate()?;
        let stored = self.require(ctx, policy.name()).await?;
        if policy.version() <= stored.version() {
            return Err(PolicyError::VersionConflict {
                name: stored.name().to_string(),
                stored: stored.version(),
                attempted: policy.version(),
            });
        }
        policy.stamp(stored.version() + 1, Utc::now());
        self.persist_update(ctx, policy).await
    }

    /// Fetch, mutate and persist in one step. A mutation that fails validation leaves the
    /// store untouched; one that changes nothing returns the stored policy without a write.
    pub async fn update_policy_with<F>(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        mutate: F,
    ) -> Result<Policy, PolicyError>
    where
        F: FnOnce(&mut Policy) -> Result<(), InvalidPolicyError> + Send,
    {
        self.update_policy_at(ctx, name, None, mutate).await
    }

    /// Like [`update_policy_with`](Self::update_policy_with), failing with
    /// [`PolicyError::VersionConflict`] unless the stored version equals `expected_version`.
    pub async fn update_policy_at<F>(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        expected_version: Option<u64>,
        mutate: F,
    ) -> Result<Policy, PolicyError>
    where
        F: FnOnce(&mut Policy) -> Result<(), InvalidPolicyError> + Send,
    {
        let stored = self.require(ctx, name).await?;
        if let Some(expected) = expected_version {
            if expected != stored.version() {
                return Err(PolicyError::VersionConflict {
                    name: name.to_string(),
                    stored: stored.version(),
                    attempted: expected,
                });
            }
        }

        let mut next = stored.clone();
        mutate(&mut next)?;
        if next.same_patterns(&stored) {
            return Ok(stored);
        }
        next.validate()?;
        next.stamp(stored.version() + 1, Utc::now());
        self.persist_update(ctx, next).await
    }

    pub async fn delete_policy(&self, ctx: &ExecutionContext, name: &str) -> Result<(), PolicyError> {
        let stored = self.require(ctx, name).await?;
        if !self.repository.delete(ctx, name).await? {
            return Err(PolicyError::NotFound { name: name.to_string() });
        }
        tracing::info!(policy = %name, version = stored.version(), "policy deleted");
        self.publish(ctx, PolicyEvent::deleted(&stored)).await;
        Ok(())
    }

    /// All policies, sorted by name.
    pub async fn list_policies(&self, ctx: &ExecutionContext) -> Result<Vec<Policy>, PolicyError> {
        let mut policies = self.repository.list(ctx).await?;
        policies.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(policies)
    }

    /// Subscribe to lifecycle events for `names` (all policies when empty).
    ///
    /// The watch ends when `ctx` is cancelled or its deadline passes. Events published while
    /// the buffer is full are dropped and counted.
    pub fn watch_policies<I, S>(&self, ctx: &ExecutionContext, names: I) -> Result<PolicyWatch, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ctx.check()?;
        let filter: HashSet<String> = names.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(self.watch_buffer);
        let dropped = Arc::new(AtomicU64::new(0));

        let counter = dropped.clone();
        let id = self.publisher.subscribe(Arc::new(move |event: &PolicyEvent| {
            if !filter.is_empty() && !filter.contains(&event.policy_name) {
                return;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        policy = %event.policy_name,
                        kind = %event.kind,
                        version = event.version,
                        "policy watcher is lagging, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }));

        Ok(PolicyWatch { rx, ctx: ctx.clone(), publisher: self.publisher.clone(), id, dropped })
    }

    async fn require(&self, ctx: &ExecutionContext, name: &str) -> Result<Policy, PolicyError> {
        self.repository
            .get(ctx, name)
            .await?
            .ok_or_else(|| PolicyError::NotFound { name: name.to_string() })
    }

    async fn persist_update(&self, ctx: &ExecutionContext, policy: Policy) -> Result<Policy, PolicyError> {
        let updated = self.repository.save(ctx, policy).await?;
        tracing::info!(policy = %updated.name(), version = updated.version(), "policy updated");
        self.publish(ctx, PolicyEvent::updated(&updated)).await;
        Ok(updated)
    }

    async fn publish(&self, ctx: &ExecutionContext, event: PolicyEvent) {
        let (name, kind) = (event.policy_name.clone(), event.kind);
        if let Err(err) = self.publisher.publish(ctx, event).await {
            tracing::warn!(policy = %name, %kind, error = %err, "failed to publish policy event");
        }
    }
}

/// A live, context-scoped subscription to policy events. Dropping it unsubscribes.
#[derive(Debug)]
pub struct PolicyWatch {
    rx: mpsc::Receiver<PolicyEvent>,
    ctx: ExecutionContext,
    publisher: Arc<dyn EventPublisher>,
    id: SubscriptionId,
    dropped: Arc<AtomicU64>,
}

impl PolicyWatch {
    /// The next event, or `None` once the context is done or the publisher went away.
    /// Nothing is returned after the context has been observed as done.
    pub async fn next(&mut self) -> Option<PolicyEvent> {
        if self.ctx.is_done() {
            self.rx.close();
            return None;
        }
        tokio::select! {
            biased;
            _ = self.ctx.done() => {
                self.rx.close();
                None
            }
            event = self.rx.recv() => event,
        }
    }

    /// Events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = PolicyEvent> + Send + 'static {
        stream::unfold(self, |mut watch| async move { watch.next().await.map(|event| (event, watch)) })
    }
}

impl Drop for PolicyWatch {
    fn drop(&mut self) {
        self.publisher.unsubscribe(self.id);
    }
}
