//! Error taxonomy for queued work.
//!
//! Every failure an operation can report is tagged with an [`ErrorKind`] so
//! the retry policy is an exhaustive match rather than message sniffing.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Closed classification of failures seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Refused at admission time because a key exceeded its window ceiling.
    RateLimit,
    /// Network failure, server error (5xx), or connection reset.
    Transient,
    /// Client errors (4xx), validation failures, programming errors.
    Permanent,
}

impl ErrorKind {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::Transient => true,
            ErrorKind::RateLimit | ErrorKind::Permanent => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// A failure returned by a queued operation, tagged with its kind.
///
/// Displays as the underlying error's message, so a caller that rejects with
/// `"boom"` sees `"boom"` come back out of the queue.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct OperationError {
    kind: ErrorKind,
    #[source]
    source: anyhow::Error,
}

impl OperationError {
    pub fn new(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Transient, source)
    }

    pub fn permanent(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Permanent, source)
    }

    /// Build a permanent error from a plain message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::permanent(anyhow::Error::msg(message))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The wrapped error, for callers that want to downcast it.
    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Why a queued request did not produce a value.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The key's fixed window is already full. The operation never ran.
    #[error("Rate limit exceeded")]
    RateLimited { key: String },

    /// The operation failed permanently or ran out of retries.
    #[error("{error}")]
    Failed {
        /// Total invocations of the operation, including the first.
        attempts: u32,
        #[source]
        error: OperationError,
    },

    /// The request's cancellation token fired before it settled.
    #[error("request cancelled")]
    Cancelled,
}

impl QueueError {
    /// Taxonomy of this rejection. Cancellation is reported as permanent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::RateLimited { .. } => ErrorKind::RateLimit,
            QueueError::Failed { error, .. } => error.kind(),
            QueueError::Cancelled => ErrorKind::Permanent,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, QueueError::RateLimited { .. })
    }

    /// Number of times the operation was invoked, if it was invoked at all.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            QueueError::Failed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
