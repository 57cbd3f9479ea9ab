//! Keeps a [`ResilienceExecutor`] in step with the policies stored behind a [`PolicyService`].
//!
//! [`PolicySync::run`] subscribes first and reconciles second, so no change made during the
//! initial listing is missed. Events that do not advance the registered version are skipped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::ExecutionContext;
use crate::events::{PolicyEvent, PolicyEventKind};
use crate::executor::ResilienceExecutor;
use crate::policy::Policy;
use crate::service::{PolicyError, PolicyService};

#[derive(Debug)]
pub struct PolicySync<E: 'static> {
    service: Arc<PolicyService>,
    executor: Arc<ResilienceExecutor<E>>,
    versions: Mutex<HashMap<String, u64>>,
}

impl<E: 'static> PolicySync<E> {
    pub fn new(service: Arc<PolicyService>, executor: Arc<ResilienceExecutor<E>>) -> Self {
        Self { service, executor, versions: Mutex::new(HashMap::new()) }
    }

    /// Version last registered with the executor for `name`.
    pub fn registered_version(&self, name: &str) -> Option<u64> {
        self.versions.lock().get(name).copied()
    }

    /// Register every stored policy once. Returns how many registrations changed.
    pub async fn sync_once(&self, ctx: &ExecutionContext) -> Result<usize, PolicyError> {
        let policies = self.service.list_policies(ctx).await?;
        let mut changed = 0;
        for policy in &policies {
            if self.apply(policy) {
                changed += 1;
            }
        }
        tracing::info!(policies = policies.len(), changed, "policy sync reconciled");
        Ok(changed)
    }

    /// Reconcile, then follow policy events until `ctx` is done.
    ///
    /// Returns `Ok(())` when the context ends the watch. Errors come only from the initial
    /// reconciliation; failures while following events are logged and the loop continues.
    pub async fn run(&self, ctx: &ExecutionContext) -> Result<(), PolicyError> {
        let mut watch = self.service.watch_policies(ctx, Vec::<String>::new())?;
        self.sync_once(ctx).await?;

        while let Some(event) = watch.next().await {
            self.handle(ctx, &event).await;
        }
        tracing::debug!(dropped = watch.dropped(), "policy sync stopped");
        Ok(())
    }

    async fn handle(&self, ctx: &ExecutionContext, event: &PolicyEvent) {
        match event.kind {
            PolicyEventKind::Created | PolicyEventKind::Updated => {
                if self.registered_version(&event.policy_name).is_some_and(|v| v >= event.version) {
                    return;
                }
                match self.service.get_policy(ctx, &event.policy_name).await {
                    Ok(Some(policy)) => {
                        self.apply(&policy);
                    }
                    // Deleted again before we got to it; the delete event follows.
                    Ok(None) => {}
                    Err(err) => tracing::warn!(
                        policy = %event.policy_name,
                        version = event.version,
                        error = %err,
                        "failed to load policy for sync"
                    ),
                }
            }
            PolicyEventKind::Deleted => {
                self.versions.lock().remove(&event.policy_name);
                self.executor.unregister_policy(&event.policy_name);
            }
        }
    }

    fn apply(&self, policy: &Policy) -> bool {
        let mut versions = self.versions.lock();
        if versions.get(policy.name()).is_some_and(|&v| v >= policy.version()) {
            return false;
        }
        match self.executor.register_policy(policy.to_config()) {
            Ok(()) => {
                versions.insert(policy.name().to_string(), policy.version());
                true
            }
            Err(err) => {
                tracing::warn!(policy = %policy.name(), version = policy.version(), error = %err, "policy rejected by executor");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventPublisher;
    use crate::policy::{CircuitBreakerConfig, RetryConfig};
    use crate::repository::{InMemoryPolicyStore, StorePolicyRepository};
    use std::time::Duration;

    #[derive(Debug)]
    struct Failure;

    fn fixture() -> (Arc<PolicyService>, Arc<ResilienceExecutor<Failure>>, Arc<PolicySync<Failure>>) {
        let repository = Arc::new(StorePolicyRepository::new(Arc::new(InMemoryPolicyStore::new())));
        let service = Arc::new(PolicyService::new(repository, Arc::new(InMemoryEventPublisher::new())));
        let executor = Arc::new(ResilienceExecutor::new());
        let sync = Arc::new(PolicySync::new(service.clone(), executor.clone()));
        (service, executor, sync)
    }

    #[tokio::test]
    async fn sync_once_registers_stored_policies() {
        let (service, executor, sync) = fixture();
        let ctx = ExecutionContext::background();
        service.create_policy(&ctx, "a").await.unwrap();
        service.create_policy(&ctx, "b").await.unwrap();

        assert_eq!(sync.sync_once(&ctx).await.unwrap(), 2);
        assert_eq!(executor.policy_names(), vec!["a", "b"]);
        assert_eq!(sync.sync_once(&ctx).await.unwrap(), 0, "nothing newer the second time");
    }

    #[tokio::test]
    async fn run_follows_updates_and_deletes() {
        let (service, executor, sync) = fixture();
        let ctx = ExecutionContext::background();
        service.create_policy(&ctx, "orders").await.unwrap();

        let run_ctx = ctx.child();
        let task = {
            let (sync, run_ctx) = (sync.clone(), run_ctx.clone());
            tokio::spawn(async move { sync.run(&run_ctx).await })
        };
        while sync.registered_version("orders").is_none() {
            tokio::task::yield_now().await;
        }

        service
            .update_policy_with(&ctx, "orders", |p| {
                p.set_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_secs(30))).map(|_| ())
            })
            .await
            .unwrap();
        while sync.registered_version("orders") != Some(2) {
            tokio::task::yield_now().await;
        }
        assert!(executor.policy_config("orders").unwrap().circuit_breaker.is_some());

        service.create_policy(&ctx, "payments").await.unwrap();
        service.delete_policy(&ctx, "orders").await.unwrap();
        while executor.policy_names() != vec!["payments"] {
            tokio::task::yield_now().await;
        }
        assert_eq!(sync.registered_version("orders"), None);

        run_ctx.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_events_are_skipped() {
        let (service, executor, sync) = fixture();
        let ctx = ExecutionContext::background();
        let mut policy = Policy::new("p").unwrap();
        policy.set_retry(RetryConfig::default()).unwrap();
        service.create_configured_policy(&ctx, policy).await.unwrap();
        sync.sync_once(&ctx).await.unwrap();

        let before = executor.policy_config("p");
        sync.handle(&ctx, &PolicyEvent::new(PolicyEventKind::Updated, "p", 1)).await;
        assert_eq!(executor.policy_config("p"), before);
        assert_eq!(sync.registered_version("p"), Some(1));
    }
}
