//! Execution context: cancellation, deadlines and correlation identifiers.
//!
//! Every operation in this crate takes an [`ExecutionContext`]. Cancelling the context, or
//! letting its deadline pass, makes every suspension point (bulkhead queueing, retry sleeps,
//! timeout waits, policy watches) return [`ContextError`] promptly.
//!
//! ```
//! use std::time::Duration;
//! use resilience_runtime::context::{ContextError, ExecutionContext};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let root = ExecutionContext::background().with_correlation_id("req-42");
//! let child = root.with_timeout(Duration::from_secs(5));
//! root.cancel();
//! assert_eq!(child.err(), Some(ContextError::Canceled));
//! assert_eq!(child.correlation_id(), Some("req-42"));
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation scope passed through every resilience call.
///
/// Cloning is cheap and clones observe the same cancellation. Derived contexts (`child`,
/// `with_timeout`, `with_deadline`) are cancelled with their parent but can be cancelled
/// independently.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    correlation_id: Option<Arc<str>>,
    trace_id: Option<Arc<str>>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::background()
    }
}

impl ExecutionContext {
    /// A root context with no deadline.
    pub fn background() -> Self {
        Self { token: CancellationToken::new(), deadline: None, correlation_id: None, trace_id: None }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(Arc::from(id.into()));
        self
    }

    pub fn with_trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(Arc::from(id.into()));
        self
    }

    /// Derived context sharing ids and deadline, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
        }
    }

    /// Derived context whose deadline is the earlier of `deadline` and the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        child
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// The reason this context finished, if it has.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Drive `fut` until it completes or the context finishes, whichever comes first.
    /// Cancellation wins a tie.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
