//! A unit of queued work and the handle its caller awaits.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::error::{OperationError, QueueError};

/// Where a queued request is in its life.
///
/// `Fulfilled` and `Rejected` are absorbing: a settled request never runs
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Executing,
    Retrying,
    Fulfilled,
    Rejected,
}

impl EntryState {
    /// Legal moves of the per-request state machine.
    ///
    /// `Pending -> Rejected` and `Retrying -> Rejected` only happen through
    /// cancellation.
    pub fn can_advance_to(self, next: EntryState) -> bool {
        use EntryState as S;
        matches!(
            (self, next),
            (S::Pending, S::Executing)
                | (S::Pending, S::Rejected)
                | (S::Executing, S::Fulfilled)
                | (S::Executing, S::Retrying)
                | (S::Executing, S::Rejected)
                | (S::Retrying, S::Pending)
                | (S::Retrying, S::Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Fulfilled | EntryState::Rejected)
    }
}

/// Result of one attempt. On failure the job is handed back so the queue can
/// retry or reject it.
pub(crate) type AttemptOutcome = Result<(), (Box<dyn Job>, OperationError)>;

/// Type-erased operation plus the channel that settles its caller.
pub(crate) trait Job: Send {
    /// Run the operation once. A success settles the caller.
    ///
    /// The operation is invoked before this returns; the future only drives
    /// it to completion. A panic, at invocation or while polling, comes back
    /// as a permanent failure.
    fn attempt(self: Box<Self>) -> BoxFuture<'static, AttemptOutcome>;

    /// Settle the caller with an error.
    fn reject(self: Box<Self>, error: QueueError);
}

struct TypedJob<T, F> {
    operation: F,
    settle: oneshot::Sender<Result<T, QueueError>>,
}

impl<T, F, Fut> Job for TypedJob<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
{
    fn attempt(mut self: Box<Self>) -> BoxFuture<'static, AttemptOutcome> {
        let fut = match panic::catch_unwind(AssertUnwindSafe(|| (self.operation)())) {
            Ok(fut) => fut,
            Err(payload) => {
                let error = panicked(payload);
                return Box::pin(async move { Err((self as Box<dyn Job>, error)) });
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => {
                    // A dropped handle just means nobody is listening.
                    let _ = self.settle.send(Ok(value));
                    Ok(())
                }
                Ok(Err(e)) => Err((self as Box<dyn Job>, e)),
                Err(payload) => Err((self as Box<dyn Job>, panicked(payload))),
            }
        })
    }

    fn reject(self: Box<Self>, error: QueueError) {
        let _ = self.settle.send(Err(error));
    }
}

/// Turn a caught panic into a permanent failure carrying its message.
fn panicked(payload: Box<dyn Any + Send>) -> OperationError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(panic = %message, "queued operation panicked");
    OperationError::permanent(anyhow::anyhow!("operation panicked: {}", message))
}

/// Bookkeeping that travels with a request across attempts.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub id: Uuid,
    pub key: Option<String>,
    pub retry_count: u32,
    pub cancel: Option<CancellationToken>,
    pub state: EntryState,
}

impl Ticket {
    pub fn advance(&mut self, next: EntryState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// A request waiting for, holding, or backing off from a concurrency slot.
pub(crate) struct QueuedRequest {
    pub ticket: Ticket,
    pub job: Box<dyn Job>,
}

impl QueuedRequest {
    /// Wrap `operation` and return the request with its caller's handle.
    pub fn new<T, F, Fut>(
        operation: F,
        key: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> (Self, Pending<T>)
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let request = Self {
            ticket: Ticket {
                id,
                key,
                retry_count: 0,
                cancel,
                state: EntryState::Pending,
            },
            job: Box::new(TypedJob {
                operation,
                settle: tx,
            }),
        };
        (request, Pending::queued(id, rx))
    }
}

enum PendingInner<T> {
    Refused(Option<QueueError>),
    Queued(oneshot::Receiver<Result<T, QueueError>>),
}

/// Handle to a request submitted with [`RequestQueue::add`].
///
/// Resolves exactly once. A request refused at admission resolves on its
/// first poll. If the queue drops the request without settling it (it was
/// cancelled) the handle resolves to [`QueueError::Cancelled`].
///
/// Dropping the handle does not cancel the work.
///
/// [`RequestQueue::add`]: super::RequestQueue::add
#[must_use = "a Pending does nothing unless awaited"]
pub struct Pending<T> {
    id: Option<Uuid>,
    inner: PendingInner<T>,
}

impl<T> Pending<T> {
    fn queued(id: Uuid, rx: oneshot::Receiver<Result<T, QueueError>>) -> Self {
        Self {
            id: Some(id),
            inner: PendingInner::Queued(rx),
        }
    }

    pub(crate) fn refused(error: QueueError) -> Self {
        Self {
            id: None,
            inner: PendingInner::Refused(Some(error)),
        }
    }

    /// Diagnostic id of the queued request, `None` if it was refused.
    pub fn id(&self) -> Option<Uuid> {
        self.id
    }

    /// Whether the request made it past admission control.
    pub fn is_admitted(&self) -> bool {
        matches!(self.inner, PendingInner::Queued(_))
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Refused(error) => {
                Poll::Ready(Err(error.take().unwrap_or(QueueError::Cancelled)))
            }
            PendingInner::Queued(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
