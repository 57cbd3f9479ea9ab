//! Policy lifecycle events and their publisher.
//!
//! The service emits one [`PolicyEvent`] per successful create, update or delete. Delivery is
//! fan-out to every subscriber, at least once, with no replay beyond the process lifetime.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ContextError, ExecutionContext};
use crate::policy::Policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEventKind {
    Created,
    Updated,
    Deleted,
}

impl PolicyEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for PolicyEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvent {
    pub id: Uuid,
    pub kind: PolicyEventKind,
    pub policy_name: String,
    /// Policy version after the change; for deletes, the last stored version.
    pub version: u64,
    pub occurred_at: DateTime<Utc>,
}

impl PolicyEvent {
    pub fn new(kind: PolicyEventKind, policy_name: impl Into<String>, version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            policy_name: policy_name.into(),
            version,
            occurred_at: Utc::now(),
        }
    }

    pub fn created(policy: &Policy) -> Self {
        Self::new(PolicyEventKind::Created, policy.name(), policy.version())
    }

    pub fn updated(policy: &Policy) -> Self {
        Self::new(PolicyEventKind::Updated, policy.name(), policy.version())
    }

    pub fn deleted(policy: &Policy) -> Self {
        Self::new(PolicyEventKind::Deleted, policy.name(), policy.version())
    }
}

pub type EventHandler = Arc<dyn Fn(&PolicyEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("event publisher is closed")]
    Closed,
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[async_trait]
pub trait EventPublisher: Send + Sync + fmt::Debug {
    async fn publish(&self, ctx: &ExecutionContext, event: PolicyEvent) -> Result<(), PublishError>;

    fn subscribe(&self, handler: EventHandler) -> SubscriptionId;

    /// Returns whether the subscription existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Synchronous in-process fan-out.
///
/// Handlers run on the publishing task, in subscription order, outside the subscriber lock, so
/// a handler may subscribe or unsubscribe. They must not block. A panicking handler is logged
/// and skipped.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    subscribers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
}

impl fmt::Debug for InMemoryEventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventPublisher")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Events accepted since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Reject every later publish with [`PublishError::Closed`] and drop all subscribers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.write().clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, ctx: &ExecutionContext, event: PolicyEvent) -> Result<(), PublishError> {
        ctx.check()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<(SubscriptionId, EventHandler)> = self.subscribers.read().clone();
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(
                    subscription = id.0,
                    policy = %event.policy_name,
                    kind = %event.kind,
                    "policy event handler panicked"
                );
            }
        }
        Ok(())
    }

    fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collector() -> (Arc<Mutex<Vec<PolicyEvent>>>, EventHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |e: &PolicyEvent| sink.lock().push(e.clone())))
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let publisher = InMemoryEventPublisher::new();
        let (a, handler_a) = collector();
        let (b, handler_b) = collector();
        publisher.subscribe(handler_a);
        publisher.subscribe(handler_b);

        let event = PolicyEvent::new(PolicyEventKind::Created, "p", 1);
        publisher.publish(&ExecutionContext::background(), event.clone()).await.unwrap();

        assert_eq!(*a.lock(), vec![event.clone()]);
        assert_eq!(*b.lock(), vec![event]);
    }

    #[tokio::test]
    async fn unsubscribed_handler_stops_receiving() {
        let publisher = InMemoryEventPublisher::new();
        let (seen, handler) = collector();
        let id = publisher.subscribe(handler);
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));

        publisher
            .publish(&ExecutionContext::background(), PolicyEvent::new(PolicyEventKind::Deleted, "p", 3))
            .await
            .unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_does_not_starve_others() {
        let publisher = InMemoryEventPublisher::new();
        publisher.subscribe(Arc::new(|_: &PolicyEvent| panic!("bad handler")));
        let (seen, handler) = collector();
        publisher.subscribe(handler);

        publisher
            .publish(&ExecutionContext::background(), PolicyEvent::new(PolicyEventKind::Updated, "p", 2))
            .await
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn closed_publisher_rejects() {
        let publisher = InMemoryEventPublisher::new();
        publisher.close();
        let err = publisher
            .publish(&ExecutionContext::background(), PolicyEvent::new(PolicyEventKind::Created, "p", 1))
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::Closed);
    }

    #[test]
    fn event_serializes_kind_in_snake_case() {
        let event = PolicyEvent::new(PolicyEventKind::Updated, "checkout", 4);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "updated");
        assert_eq!(json["policy_name"], "checkout");
    }
}
