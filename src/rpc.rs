//! Transport-neutral RPC façade over the policy service and the executor.
//!
//! [`PolicyRpcHandler`] implements the policy RPCs on top of [`PolicyService`] and maps every
//! failure to a [`Status`]. [`PolicyRpcService`] exposes the unary RPCs as a
//! `tower_service::Service<RpcCall>` so any tower-based transport can mount them.

pub mod messages;
pub mod status;

pub use messages::{
    BulkheadMessage, CircuitBreakerMessage, CreatePolicyRequest, CreatePolicyResponse,
    DeletePolicyRequest, DeletePolicyResponse, GetPolicyRequest, GetPolicyResponse,
    ListPoliciesRequest, ListPoliciesResponse, PolicyEventMessage, PolicyMessage, PolicyPatterns,
    RateLimitMessage, RetryMessage, TimeoutMessage, UpdatePolicyRequest, UpdatePolicyResponse,
    WatchPoliciesRequest,
};
pub use status::{Status, StatusCode};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tower_service::Service;

use crate::context::ExecutionContext;
use crate::error::{InvalidPolicyError, ResilienceError};
use crate::executor::ResilienceExecutor;
use crate::policy::Policy;
use crate::service::{PolicyError, PolicyService};

pub struct PolicyRpcHandler<E: 'static> {
    service: Arc<PolicyService>,
    executor: Arc<ResilienceExecutor<E>>,
    // Version and creation time of the stored policy each executor registration was built
    // from. A policy recreated under the same name restarts at version 1.
    registered: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl<E: 'static> fmt::Debug for PolicyRpcHandler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRpcHandler")
            .field("service", &self.service)
            .field("executor", &self.executor)
            .finish()
    }
}

impl<E: 'static> PolicyRpcHandler<E> {
    pub fn new(service: Arc<PolicyService>, executor: Arc<ResilienceExecutor<E>>) -> Self {
        Self { service, executor, registered: Mutex::new(HashMap::new()) }
    }

    pub fn service(&self) -> &Arc<PolicyService> {
        &self.service
    }

    pub fn executor(&self) -> &Arc<ResilienceExecutor<E>> {
        &self.executor
    }

    pub async fn create_policy(
        &self,
        ctx: &ExecutionContext,
        request: CreatePolicyRequest,
    ) -> Result<CreatePolicyResponse, Status> {
        let mut policy = Policy::new(request.name).map_err(invalid)?;
        request.patterns.apply_to(&mut policy).map_err(invalid)?;
        let created = self.service.create_configured_policy(ctx, policy).await?;
        Ok(CreatePolicyResponse { policy: created.into() })
    }

    pub async fn get_policy(
        &self,
        ctx: &ExecutionContext,
        request: GetPolicyRequest,
    ) -> Result<GetPolicyResponse, Status> {
        match self.service.get_policy(ctx, &request.name).await? {
            Some(policy) => Ok(GetPolicyResponse { policy: policy.into() }),
            None => Err(Status::new(StatusCode::NotFound, format!("policy '{}' not found", request.name))),
        }
    }

    /// Replace the policy's patterns with the request's. Applied all-or-nothing.
    pub async fn update_policy(
        &self,
        ctx: &ExecutionContext,
        request: UpdatePolicyRequest,
    ) -> Result<UpdatePolicyResponse, Status> {
        let UpdatePolicyRequest { name, expected_version, patterns } = request;
        let updated = self
            .service
            .update_policy_at(ctx, &name, expected_version, |policy| patterns.apply_to(policy))
            .await?;
        Ok(UpdatePolicyResponse { policy: updated.into() })
    }

    pub async fn delete_policy(
        &self,
        ctx: &ExecutionContext,
        request: DeletePolicyRequest,
    ) -> Result<DeletePolicyResponse, Status> {
        self.service.delete_policy(ctx, &request.name).await?;
        self.forget(&request.name);
        Ok(DeletePolicyResponse {})
    }

    pub async fn list_policies(
        &self,
        ctx: &ExecutionContext,
        _request: ListPoliciesRequest,
    ) -> Result<ListPoliciesResponse, Status> {
        let policies = self.service.list_policies(ctx).await?;
        Ok(ListPoliciesResponse { policies: policies.iter().map(PolicyMessage::from).collect() })
    }

    /// Stream policy events until `ctx` is done.
    pub fn watch_policies(
        &self,
        ctx: &ExecutionContext,
        request: WatchPoliciesRequest,
    ) -> Result<BoxStream<'static, PolicyEventMessage>, Status> {
        let watch = self.service.watch_policies(ctx, request.policy_names)?;
        Ok(watch.into_stream().map(PolicyEventMessage::from).boxed())
    }

    /// Run `operation` under the stored policy `policy_name`.
    ///
    /// The policy is read through the service (cache-first when the repository caches). When
    /// its stored version differs from the one the executor runs, the executor's registration
    /// is rebuilt first.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        policy_name: &str,
        operation: Op,
    ) -> Result<T, Status>
    where
        E: fmt::Display,
        Op: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = match self.service.get_policy(ctx, policy_name).await? {
            Some(policy) => policy,
            None => {
                self.forget(policy_name);
                let err: ResilienceError<E> = ResilienceError::PolicyNotFound { name: policy_name.to_string() };
                return Err(Status::from(err));
            }
        };
        self.ensure_registered(&policy).map_err(Status::from)?;
        self.executor
            .execute_with_result(ctx, policy_name, operation)
            .await
            .map_err(|err| Status::from(&err))
    }

    fn ensure_registered(&self, policy: &Policy) -> Result<(), ResilienceError<E>> {
        let identity = (policy.version(), policy.created_at());
        let mut registered = self.registered.lock();
        let previous = registered.get(policy.name()).copied();
        if previous == Some(identity) && self.executor.policy_config(policy.name()).is_some() {
            return Ok(());
        }
        // Registering an identical config keeps the live primitives, so a recreated policy
        // has to drop the old runtime first.
        if previous.is_some_and(|(_, created_at)| created_at != policy.created_at()) {
            self.executor.unregister_policy(policy.name());
        }
        self.executor.register_policy(policy.to_config())?;
        registered.insert(policy.name().to_string(), identity);
        tracing::debug!(policy = %policy.name(), version = policy.version(), "executor policy refreshed");
        Ok(())
    }

    fn forget(&self, name: &str) {
        if self.registered.lock().remove(name).is_some() {
            self.executor.unregister_policy(name);
        }
    }
}

fn invalid(err: InvalidPolicyError) -> Status {
    Status::from(PolicyError::Invalid(err))
}

/// One unary RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    CreatePolicy(CreatePolicyRequest),
    GetPolicy(GetPolicyRequest),
    UpdatePolicy(UpdatePolicyRequest),
    DeletePolicy(DeletePolicyRequest),
    ListPolicies(ListPoliciesRequest),
}

impl RpcRequest {
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CreatePolicy(_) => "CreatePolicy",
            Self::GetPolicy(_) => "GetPolicy",
            Self::UpdatePolicy(_) => "UpdatePolicy",
            Self::DeletePolicy(_) => "DeletePolicy",
            Self::ListPolicies(_) => "ListPolicies",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    CreatePolicy(CreatePolicyResponse),
    GetPolicy(GetPolicyResponse),
    UpdatePolicy(UpdatePolicyResponse),
    DeletePolicy(DeletePolicyResponse),
    ListPolicies(ListPoliciesResponse),
}

/// A request together with the context it runs under.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub context: ExecutionContext,
    pub request: RpcRequest,
}

impl RpcCall {
    pub fn new(context: ExecutionContext, request: RpcRequest) -> Self {
        Self { context, request }
    }
}

/// Tower adapter for the unary policy RPCs. Always ready.
pub struct PolicyRpcService<E: 'static> {
    handler: Arc<PolicyRpcHandler<E>>,
}

impl<E: 'static> Clone for PolicyRpcService<E> {
    fn clone(&self) -> Self {
        Self { handler: self.handler.clone() }
    }
}

impl<E: 'static> fmt::Debug for PolicyRpcService<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRpcService").field("handler", &self.handler).finish()
    }
}

impl<E: 'static> PolicyRpcService<E> {
    pub fn new(handler: Arc<PolicyRpcHandler<E>>) -> Self {
        Self { handler }
    }
}

impl<E> Service<RpcCall> for PolicyRpcService<E>
where
    E: Send + Sync + 'static,
{
    type Response = RpcResponse;
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: RpcCall) -> Self::Future {
        let handler = self.handler.clone();
        Box::pin(async move {
            let RpcCall { context: ctx, request } = call;
            let method = request.method();
            let result = match request {
                RpcRequest::CreatePolicy(r) => handler.create_policy(&ctx, r).await.map(RpcResponse::CreatePolicy),
                RpcRequest::GetPolicy(r) => handler.get_policy(&ctx, r).await.map(RpcResponse::GetPolicy),
                RpcRequest::UpdatePolicy(r) => handler.update_policy(&ctx, r).await.map(RpcResponse::UpdatePolicy),
                RpcRequest::DeletePolicy(r) => handler.delete_policy(&ctx, r).await.map(RpcResponse::DeletePolicy),
                RpcRequest::ListPolicies(r) => handler.list_policies(&ctx, r).await.map(RpcResponse::ListPolicies),
            };
            if let Err(status) = &result {
                tracing::debug!(method, code = %status.code, message = %status.message, "rpc failed");
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventPublisher;
    use crate::repository::{CacheConfig, CachedPolicyRepository, InMemoryPolicyStore, StorePolicyRepository};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Upstream(&'static str);

    impl fmt::Display for Upstream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    fn handler() -> PolicyRpcHandler<Upstream> {
        let store = StorePolicyRepository::new(Arc::new(InMemoryPolicyStore::new()));
        let repository = Arc::new(CachedPolicyRepository::new(store, CacheConfig::default()));
        let service = Arc::new(PolicyService::new(repository, Arc::new(InMemoryEventPublisher::new())));
        PolicyRpcHandler::new(service, Arc::new(ResilienceExecutor::new()))
    }

    fn breaker(threshold: u32) -> PolicyPatterns {
        PolicyPatterns {
            circuit_breaker: Some(CircuitBreakerMessage {
                failure_threshold: threshold,
                success_threshold: 1,
                timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            }),
            ..PolicyPatterns::default()
        }
    }

    #[tokio::test]
    async fn create_rejects_invalid_patterns_with_the_field() {
        let h = handler();
        let status = h
            .create_policy(
                &ExecutionContext::background(),
                CreatePolicyRequest { name: "p".into(), patterns: breaker(0) },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::InvalidArgument);
        assert!(status.message.contains("circuit_breaker.failure_threshold"), "{status}");
    }

    #[tokio::test]
    async fn update_with_stale_expected_version_is_aborted() {
        let h = handler();
        let ctx = ExecutionContext::background();
        h.create_policy(&ctx, CreatePolicyRequest { name: "p".into(), patterns: PolicyPatterns::default() })
            .await
            .unwrap();

        let updated = h
            .update_policy(
                &ctx,
                UpdatePolicyRequest { name: "p".into(), expected_version: Some(1), patterns: breaker(2) },
            )
            .await
            .unwrap();
        assert_eq!(updated.policy.version, 2);

        let status = h
            .update_policy(
                &ctx,
                UpdatePolicyRequest { name: "p".into(), expected_version: Some(1), patterns: breaker(4) },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::Aborted);
    }

    #[tokio::test]
    async fn execute_picks_up_policy_changes() {
        let h = handler();
        let ctx = ExecutionContext::background();
        h.create_policy(&ctx, CreatePolicyRequest { name: "p".into(), patterns: breaker(1) })
            .await
            .unwrap();

        let calls = &AtomicU32::new(0);
        let failing = move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Upstream("down"))
        };
        assert_eq!(h.execute(&ctx, "p", failing).await.unwrap_err().code, StatusCode::Internal);
        assert_eq!(h.execute(&ctx, "p", failing).await.unwrap_err().code, StatusCode::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A new version rebuilds the runtime with a closed breaker.
        h.update_policy(&ctx, UpdatePolicyRequest { name: "p".into(), expected_version: None, patterns: breaker(5) })
            .await
            .unwrap();
        let value = h.execute(&ctx, "p", |_| async { Ok::<_, Upstream>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn execute_unknown_policy_is_not_found() {
        let h = handler();
        let status = h
            .execute(&ExecutionContext::background(), "ghost", |_| async { Ok::<_, Upstream>(()) })
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn get_and_delete_unknown_are_not_found() {
        let h = handler();
        let ctx = ExecutionContext::background();
        let get = h.get_policy(&ctx, GetPolicyRequest { name: "x".into() }).await.unwrap_err();
        let delete = h.delete_policy(&ctx, DeletePolicyRequest { name: "x".into() }).await.unwrap_err();
        assert_eq!((get.code, delete.code), (StatusCode::NotFound, StatusCode::NotFound));
    }
}
