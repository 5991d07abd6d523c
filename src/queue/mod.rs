//! Request queue with per-key rate limiting, a global concurrency cap, and
//! retry with exponential backoff.
//!
//! Callers hand the queue a zero-argument async operation and an optional
//! rate-limit key. The queue decides admission on the spot, runs at most
//! `max_concurrent` operations at a time, retries transient failures, and
//! settles the caller's [`Pending`] handle exactly once.
//!
//! All state sits behind one `std::sync::Mutex` that is never held across an
//! `.await`, so each transition (admit, dispatch, release, requeue) is atomic
//! with respect to every other caller.

pub mod clock;
mod entry;
pub mod ledger;
pub mod retry;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{OperationError, QueueError};

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::entry::{EntryState, Pending};
pub use self::ledger::RateLimitLedger;
pub use self::retry::RetryPolicy;

use self::entry::{AttemptOutcome, QueuedRequest, Ticket};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Requests waiting for a slot (including retries that finished backing off).
    pub pending: usize,
    /// Operations currently executing.
    pub active: usize,
    pub max_concurrent: usize,
    /// `(key, window)` entries held by the rate-limit ledger.
    pub ledger_entries: usize,
    pub admitted: u64,
    pub rate_limited: u64,
    pub retried: u64,
    pub fulfilled: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    admitted: u64,
    rate_limited: u64,
    retried: u64,
    fulfilled: u64,
    rejected: u64,
    cancelled: u64,
}

/// How a slot was given back.
#[derive(Debug, Clone, Copy)]
enum Release {
    Fulfilled,
    Rejected,
    Retrying,
    Cancelled,
}

// ---------------------------------------------------------------------------
// RequestQueue
// ---------------------------------------------------------------------------

struct QueueState {
    pending: VecDeque<QueuedRequest>,
    ledger: RateLimitLedger,
    active: usize,
    /// Set while some caller is running the dispatch loop.
    dispatching: bool,
    counters: Counters,
}

/// What the dispatch loop took off the head of `pending`.
enum Ready {
    Start(QueuedRequest),
    Abandoned(QueuedRequest),
}

impl QueueState {
    /// Pop the next request if a slot is free, claiming the slot for it.
    /// Cancelled requests come back as abandoned without taking a slot.
    fn next_ready(&mut self, max_concurrent: usize) -> Option<Ready> {
        if self.active >= max_concurrent {
            return None;
        }
        let mut request = self.pending.pop_front()?;
        if request.ticket.is_cancelled() {
            request.ticket.advance(EntryState::Rejected);
            self.counters.cancelled += 1;
            return Some(Ready::Abandoned(request));
        }
        request.ticket.advance(EntryState::Executing);
        self.active += 1;
        Some(Ready::Start(request))
    }
}

struct Shared {
    config: QueueConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

/// Shared handle to one queue. Clones refer to the same queue.
///
/// Must be used from within a Tokio runtime: dispatched operations run on
/// spawned tasks.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl RequestQueue {
    /// Zero limits in `config` are raised to 1 (see [`QueueConfig::clamped`]).
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a queue whose rate-limit windows follow `clock`.
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.clamped();
        let ledger = RateLimitLedger::new(config.rate_limit_window_ms, config.rate_limit_max_requests);
        let retry = RetryPolicy::from_config(&config);
        Self {
            shared: Arc::new(Shared {
                retry,
                clock,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    ledger,
                    active: 0,
                    dispatching: false,
                    counters: Counters::default(),
                }),
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Submit `operation`, rate limited under `key` when one is given.
    ///
    /// Admission is decided before this returns: if `key`'s current window
    /// is full the handle resolves to [`QueueError::RateLimited`] and the
    /// operation is never invoked. When a slot is free the operation is
    /// invoked before this returns, on the calling thread.
    pub fn add<T, F, Fut>(&self, operation: F, key: Option<&str>) -> Pending<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        self.submit(operation, key, None)
    }

    /// Like [`add`](Self::add), but the request is abandoned once `cancel`
    /// fires: removed if still waiting, dropped if executing, and woken early
    /// if backing off. The handle then resolves to [`QueueError::Cancelled`].
    pub fn add_with_cancel<T, F, Fut>(
        &self,
        operation: F,
        key: Option<&str>,
        cancel: CancellationToken,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        self.submit(operation, key, Some(cancel))
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        QueueStats {
            pending: state.pending.len(),
            active: state.active,
            max_concurrent: self.shared.config.max_concurrent,
            ledger_entries: state.ledger.len(),
            admitted: state.counters.admitted,
            rate_limited: state.counters.rate_limited,
            retried: state.counters.retried,
            fulfilled: state.counters.fulfilled,
            rejected: state.counters.rejected,
            cancelled: state.counters.cancelled,
        }
    }

    fn submit<T, F, Fut>(
        &self,
        operation: F,
        key: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let now = self.shared.clock.now_millis();
        let pending = {
            let mut state = self.shared.lock();
            match key {
                Some(key) => {
                    if !state.ledger.try_admit(key, now) {
                        state.counters.rate_limited += 1;
                        return Pending::refused(QueueError::RateLimited {
                            key: key.to_string(),
                        });
                    }
                }
                None => {
                    let window_start = state.ledger.window_start(now);
                    state.ledger.sweep(window_start);
                }
            }

            let (request, pending) =
                QueuedRequest::new(operation, key.map(str::to_string), cancel);
            debug!(
                id = %request.ticket.id,
                key = ?request.ticket.key,
                queued = state.pending.len() + 1,
                "request queued"
            );
            state.pending.push_back(request);
            state.counters.admitted += 1;
            pending
        };

        self.shared.dispatch();
        pending
    }
}

// ---------------------------------------------------------------------------
// Dispatch and execution
// ---------------------------------------------------------------------------

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start pending requests, oldest first, while the concurrency budget
    /// allows.
    ///
    /// One caller drives the loop at a time. A trigger that arrives while
    /// another caller is dispatching only leaves its work behind; the active
    /// dispatcher sees it before it stops. Each operation is invoked here,
    /// outside the lock, in the order its request left `pending`.
    fn dispatch(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let next = {
                let mut state = self.lock();
                match state.next_ready(self.config.max_concurrent) {
                    Some(next) => next,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            match next {
                Ready::Start(request) => self.start(request),
                // Dropping a request drops its settle channel, which the
                // caller observes as cancellation.
                Ready::Abandoned(request) => {
                    debug!(id = %request.ticket.id, "dropping cancelled request");
                }
            }
        }
    }

    /// Invoke the operation and hand the running attempt to its own task.
    fn start(self: &Arc<Self>, request: QueuedRequest) {
        let QueuedRequest { ticket, job } = request;
        debug!(id = %ticket.id, attempt = ticket.retry_count + 1, "executing request");
        let running = job.attempt();
        tokio::spawn(Arc::clone(self).execute(ticket, running));
    }

    /// Give back a concurrency slot and let the next request in.
    fn release(self: &Arc<Self>, how: Release) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            let counters = &mut state.counters;
            match how {
                Release::Fulfilled => counters.fulfilled += 1,
                Release::Rejected => counters.rejected += 1,
                Release::Retrying => counters.retried += 1,
                Release::Cancelled => counters.cancelled += 1,
            }
        }
        self.dispatch();
    }

    /// Put a retry at the head of the pending list, ahead of fresh work.
    fn requeue_front(self: &Arc<Self>, mut request: QueuedRequest) {
        request.ticket.advance(EntryState::Pending);
        self.lock().pending.push_front(request);
        self.dispatch();
    }

    async fn execute(
        self: Arc<Self>,
        mut ticket: Ticket,
        running: BoxFuture<'static, AttemptOutcome>,
    ) {
        let id = ticket.id;
        let attempt = ticket.retry_count + 1;

        let outcome = match ticket.cancel.clone() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                outcome = running => Some(outcome),
            },
            None => Some(running.await),
        };

        let (job, error) = match outcome {
            Some(Ok(())) => {
                ticket.advance(EntryState::Fulfilled);
                debug!(id = %id, attempt = attempt, "request fulfilled");
                self.release(Release::Fulfilled);
                return;
            }
            None => {
                // The attempt future owned the job; dropping it unblocked the
                // caller with `Cancelled`.
                ticket.advance(EntryState::Rejected);
                debug!(id = %id, attempt = attempt, "request cancelled while executing");
                self.release(Release::Cancelled);
                return;
            }
            Some(Err(failure)) => failure,
        };

        if !self.retry.should_retry(error.kind(), ticket.retry_count) {
            ticket.advance(EntryState::Rejected);
            debug!(
                id = %id,
                attempts = attempt,
                kind = %error.kind(),
                error = %error,
                "request rejected"
            );
            job.reject(QueueError::Failed {
                attempts: attempt,
                error,
            });
            self.release(Release::Rejected);
            return;
        }

        ticket.advance(EntryState::Retrying);
        ticket.retry_count += 1;
        let delay = self.retry.delay_for(ticket.retry_count);
        warn!(
            id = %id,
            retry = ticket.retry_count,
            max_retries = self.retry.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "transient failure, backing off"
        );

        // The slot is free while we wait.
        self.release(Release::Retrying);

        if let Some(token) = ticket.cancel.clone() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    ticket.advance(EntryState::Rejected);
                    debug!(id = %id, "request cancelled during backoff");
                    job.reject(QueueError::Cancelled);
                    self.lock().counters.cancelled += 1;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            tokio::time::sleep(delay).await;
        }

        self.requeue_front(QueuedRequest { ticket, job });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
