//! Bulkhead: bounded concurrency with a bounded FIFO wait queue.
//!
//! At most `max_concurrent` calls run at once and at most `max_queue` more wait for a slot.
//! Anything beyond that is rejected immediately with [`BulkheadFullError`], as is a queued call
//! that has not been granted a slot within `queue_timeout`.
//!
//! Two semaphores carry the bookkeeping: an admission gate sized `max_concurrent + max_queue`
//! and the slot pool sized `max_concurrent`. Tokio's semaphore is fair, so waiters are served
//! in arrival order and a newcomer can never overtake a queued caller.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::{ContextError, ExecutionContext};
use crate::error::{BulkheadFullError, ErrorCode, ErrorMeta, InvalidPolicyError, ResilienceError};
use crate::metrics::{MetricsRecorder, NoopMetricsRecorder};
use crate::policy::BulkheadConfig;

/// Why a slot could not be obtained.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Full(BulkheadFullError),
    #[error(transparent)]
    Context(ContextError),
}

impl<E> From<AdmissionError> for ResilienceError<E> {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Full(e) => ResilienceError::BulkheadFull(e),
            AdmissionError::Context(e) => ResilienceError::Context(e),
        }
    }
}

/// Counters for dashboards and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadStats {
    pub active: usize,
    pub queued: usize,
    pub rejected: u64,
    pub max_concurrent: usize,
    pub max_queue: usize,
}

/// A held concurrency slot. Dropping it frees the slot and hands it to the oldest waiter.
#[derive(Debug)]
pub struct BulkheadPermit {
    // Field order matters: the slot is released before the admission ticket, so a caller
    // admitted right after never finds the slot pool still exhausted.
    _slot: OwnedSemaphorePermit,
    _admission: OwnedSemaphorePermit,
    queued: bool,
}

impl BulkheadPermit {
    /// Whether the caller had to wait in the queue for this slot.
    pub fn was_queued(&self) -> bool {
        self.queued
    }
}

struct QueuedGuard<'a>(&'a AtomicUsize);

impl<'a> QueuedGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct Bulkhead {
    name: Arc<str>,
    config: BulkheadConfig,
    admission: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    rejected: Arc<AtomicU64>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, InvalidPolicyError> {
        let name = name.into();
        config.validate().map_err(|e| e.prefixed("bulkhead").for_policy(name.clone()))?;
        let total = config.max_concurrent.saturating_add(config.max_queue);
        Ok(Self {
            name: Arc::from(name),
            admission: Arc::new(Semaphore::new(total.min(Semaphore::MAX_PERMITS))),
            slots: Arc::new(Semaphore::new(config.max_concurrent.min(Semaphore::MAX_PERMITS))),
            config,
            queued: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            metrics: Arc::new(NoopMetricsRecorder),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            active: self.active(),
            queued: self.queued.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Relaxed),
            max_concurrent: self.config.max_concurrent,
            max_queue: self.config.max_queue,
        }
    }

    /// Wait for a slot, queueing if every slot is busy.
    pub async fn acquire(&self, ctx: &ExecutionContext) -> Result<BulkheadPermit, AdmissionError> {
        ctx.check().map_err(AdmissionError::Context)?;

        let admission = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(self.reject(ctx, "queue full")),
        };

        if let Ok(slot) = self.slots.clone().try_acquire_owned() {
            self.metrics.record_bulkhead_queue(ctx, &self.name, false);
            return Ok(BulkheadPermit { _slot: slot, _admission: admission, queued: false });
        }

        self.metrics.record_bulkhead_queue(ctx, &self.name, true);
        let _waiting = QueuedGuard::enter(&self.queued);
        let wait = tokio::time::timeout(self.config.queue_timeout, self.slots.clone().acquire_owned());

        tokio::select! {
            biased;
            err = ctx.done() => Err(AdmissionError::Context(err)),
            granted = wait => match granted {
                Ok(Ok(slot)) => Ok(BulkheadPermit { _slot: slot, _admission: admission, queued: true }),
                Ok(Err(_closed)) => Err(self.reject(ctx, "closed")),
                Err(_elapsed) => Err(self.reject(ctx, "queue timeout")),
            },
        }
    }

    /// Run `operation` while holding a slot. The slot is released on completion, error,
    /// cancellation or panic.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &ExecutionContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let _permit = self.acquire(ctx).await?;
        ctx.run(operation(ctx.clone())).await?
    }

    fn active(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.slots.available_permits())
    }

    fn reject(&self, ctx: &ExecutionContext, reason: &'static str) -> AdmissionError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let current_load = self.active() + self.queued.load(Ordering::Acquire);
        tracing::debug!(
            bulkhead = %self.name,
            reason,
            current_load,
            max_concurrent = self.config.max_concurrent,
            max_queue = self.config.max_queue,
            correlation_id = ctx.correlation_id(),
            "bulkhead rejected call"
        );
        AdmissionError::Full(BulkheadFullError {
            meta: ErrorMeta::new(ErrorCode::BulkheadFull).with_service(&*self.name).in_context(ctx),
            max_concurrent: self.config.max_concurrent,
            queue_size: self.config.max_queue,
            current_load,
        })
    }
}
