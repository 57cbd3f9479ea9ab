//! Transport status codes and the mapping from domain errors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ContextError;
use crate::error::ResilienceError;
use crate::service::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    Aborted,
    Unavailable,
    Internal,
}

impl StatusCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Aborted => "ABORTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code plus the original error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

fn context_code(err: ContextError) -> StatusCode {
    match err {
        ContextError::Canceled => StatusCode::Cancelled,
        ContextError::DeadlineExceeded => StatusCode::DeadlineExceeded,
    }
}

impl<E: fmt::Display> From<&ResilienceError<E>> for Status {
    fn from(err: &ResilienceError<E>) -> Self {
        let code = match err {
            ResilienceError::CircuitOpen(_) | ResilienceError::RetryExhausted(_) => StatusCode::Unavailable,
            ResilienceError::RateLimited(_) | ResilienceError::BulkheadFull(_) => StatusCode::ResourceExhausted,
            ResilienceError::Timeout(_) => StatusCode::DeadlineExceeded,
            ResilienceError::InvalidPolicy(_) => StatusCode::InvalidArgument,
            ResilienceError::PolicyNotFound { .. } => StatusCode::NotFound,
            ResilienceError::Context(e) => context_code(*e),
            ResilienceError::Inner(_) => StatusCode::Internal,
        };
        Status::new(code, err.to_string())
    }
}

impl<E: fmt::Display> From<ResilienceError<E>> for Status {
    fn from(err: ResilienceError<E>) -> Self {
        Status::from(&err)
    }
}

impl From<&PolicyError> for Status {
    fn from(err: &PolicyError) -> Self {
        let code = match err {
            PolicyError::NotFound { .. } => StatusCode::NotFound,
            PolicyError::AlreadyExists { .. } => StatusCode::AlreadyExists,
            PolicyError::Invalid(_) => StatusCode::InvalidArgument,
            PolicyError::VersionConflict { .. } => StatusCode::Aborted,
            PolicyError::Store(_) => StatusCode::Unavailable,
            PolicyError::Codec(_) => StatusCode::Internal,
            PolicyError::Context(e) => context_code(*e),
        };
        Status::new(code, err.to_string())
    }
}

impl From<PolicyError> for Status {
    fn from(err: PolicyError) -> Self {
        Status::from(&err)
    }
}
