//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Pending request table and reply correlation."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Request/reply correlation.
//!
//! Each outstanding request owns one entry in a sharded map. A reply, the
//! timeout timer, an explicit cancel and a dropped [`Awaiter`] all finish an
//! entry through the same atomic `remove`, so whichever gets there first is
//! the only one that resolves it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use courier_msg::{Envelope, MessageId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{BrokerError, CorrelationError};

/// What a pending request eventually resolves to.
pub type Reply = Result<Envelope, BrokerError>;

/// Outcome of feeding a reply to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The reply resolved a pending request.
    Resolved,
    /// No request was waiting: already completed, timed out, cancelled or never sent.
    Unknown,
}

struct PendingOperation {
    tx: oneshot::Sender<Reply>,
    registered_at: Instant,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    pending: DashMap<MessageId, PendingOperation>,
}

impl Inner {
    fn resolve(&self, id: MessageId, outcome: Reply) -> bool {
        let Some((_, operation)) = self.pending.remove(&id) else {
            return false;
        };
        if let Some(timer) = operation.timer {
            timer.abort();
        }
        trace!(
            request_id = %id,
            pending_ms = operation.registered_at.elapsed().as_millis() as u64,
            "pending request resolved"
        );
        // The awaiter may already be gone; the entry is finished either way.
        let _ = operation.tx.send(outcome);
        true
    }

    fn discard(&self, id: MessageId) {
        if let Some((_, operation)) = self.pending.remove(&id) {
            if let Some(timer) = operation.timer {
                timer.abort();
            }
            trace!(request_id = %id, "awaiter dropped, pending entry removed");
        }
    }
}

/// Table of requests awaiting a reply. Cloning shares the table.
#[derive(Clone, Default)]
pub struct CorrelationEngine {
    inner: Arc<Inner>,
}

impl CorrelationEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `request_id`. Must be called before the request is sent
    /// so a fast reply always finds its entry.
    ///
    /// With a timeout, a timer resolves the entry with
    /// [`BrokerError::Timeout`] unless something else resolves it first. A
    /// timeout too large to express as a deadline arms no timer.
    pub fn register(
        &self,
        request_id: MessageId,
        timeout: Option<Duration>,
    ) -> Result<Awaiter, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        let registered_at = Instant::now();
        let deadline = timeout.and_then(|after| registered_at.checked_add(after));
        match self.inner.pending.entry(request_id) {
            Entry::Occupied(_) => return Err(CorrelationError::Duplicate(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingOperation {
                    tx,
                    registered_at,
                    deadline,
                    timer: None,
                });
            }
        }

        if let (Some(after), Some(deadline)) = (timeout, deadline) {
            let engine = Arc::downgrade(&self.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(inner) = engine.upgrade() {
                    if inner.resolve(request_id, Err(BrokerError::Timeout { request_id, after })) {
                        debug!(request_id = %request_id, timeout_ms = after.as_millis() as u64, "request timed out");
                    }
                }
            });
            match self.inner.pending.get_mut(&request_id) {
                Some(mut operation) => operation.timer = Some(timer),
                // Already resolved between insert and here.
                None => timer.abort(),
            }
        }

        Ok(Awaiter {
            request_id,
            rx,
            engine: Arc::downgrade(&self.inner),
        })
    }

    /// Resolve a pending request with its reply.
    pub fn complete(&self, request_id: MessageId, reply: Envelope) -> Completion {
        if self.inner.resolve(request_id, Ok(reply)) {
            Completion::Resolved
        } else {
            debug!(request_id = %request_id, "reply does not match a pending request");
            Completion::Unknown
        }
    }

    /// Resolve a pending request with `error`. False when nothing was pending.
    pub fn cancel(&self, request_id: MessageId, error: BrokerError) -> bool {
        self.inner.resolve(request_id, Err(error))
    }

    /// Resolve every pending request with `error`, returning how many were pending.
    pub fn cancel_all(&self, error: BrokerError) -> usize {
        let ids: Vec<MessageId> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.inner.resolve(*id, Err(error.clone())))
            .count()
    }

    /// Number of requests still awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether `request_id` is still awaiting resolution.
    pub fn is_pending(&self, request_id: MessageId) -> bool {
        self.inner.pending.contains_key(&request_id)
    }

    /// When the timer for `request_id` fires, if it is pending with a timeout.
    pub fn deadline(&self, request_id: MessageId) -> Option<Instant> {
        self.inner
            .pending
            .get(&request_id)
            .and_then(|operation| operation.deadline)
    }
}

/// Future resolving once the request gets its reply, times out or is
/// cancelled. Dropping it unresolved removes the pending entry.
#[must_use = "dropping the awaiter abandons the request"]
pub struct Awaiter {
    request_id: MessageId,
    rx: oneshot::Receiver<Reply>,
    engine: Weak<Inner>,
}

impl Awaiter {
    /// Id of the request being awaited.
    pub fn request_id(&self) -> MessageId {
        self.request_id
    }
}

impl Future for Awaiter {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Engine dropped with the entry still in it.
            Poll::Ready(Err(_)) => Poll::Ready(Err(BrokerError::Cancelled {
                request_id: this.request_id,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Awaiter {
    fn drop(&mut self) {
        if let Some(inner) = self.engine.upgrade() {
            inner.discard(self.request_id);
        }
    }
}
