//! One-shot bridging from adapter events to awaiting callers
//!
//! Each session target (a device, a service, a characteristic) owns one
//! [`Waiters`] queue per operation kind. A caller registers *before* issuing
//! the adapter command and receives a [`Pending`] handle; the next matching
//! event resolves and removes the registration.
//!
//! A caller that gives up (cancelled future, timeout) simply drops its
//! receiver. Its slot stays queued so the reply to its command is consumed
//! and discarded rather than handed to a later caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::SessionError;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one registered operation
pub(crate) type OperationId = u64;

fn next_operation_id() -> OperationId {
    NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// What happened to an event offered to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Handed to the waiter with this id
    Delivered(OperationId),
    /// The oldest waiter had gone away; the event was dropped with its slot
    Abandoned(OperationId),
    /// Nobody was waiting
    Unclaimed,
}

struct Waiter<T> {
    id: OperationId,
    tx: oneshot::Sender<T>,
}

/// FIFO of callers waiting for the same kind of completion on one target
pub(crate) struct Waiters<T> {
    queue: Mutex<VecDeque<Waiter<T>>>,
}

impl<T> Default for Waiters<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> std::fmt::Debug for Waiters<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiters")
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl<T> Waiters<T> {
    /// Queue a new one-shot listener
    pub(crate) fn register(&self) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        let id = next_operation_id();
        self.queue.lock().push_back(Waiter { id, tx });
        Pending { id, rx }
    }

    /// Queue a listener that shares an in-flight command
    ///
    /// Returns `true` when the queue was idle, i.e. the caller is the one that
    /// must issue the adapter command.
    pub(crate) fn register_shared(&self) -> (Pending<T>, bool) {
        let (tx, rx) = oneshot::channel();
        let id = next_operation_id();
        let mut queue = self.queue.lock();
        let first = queue.is_empty();
        queue.push_back(Waiter { id, tx });
        (Pending { id, rx }, first)
    }

    /// Hand `value` to the oldest registration
    pub(crate) fn resolve_next(&self, value: T) -> Delivery {
        let Some(waiter) = self.queue.lock().pop_front() else {
            return Delivery::Unclaimed;
        };
        match waiter.tx.send(value) {
            Ok(()) => Delivery::Delivered(waiter.id),
            Err(_) => Delivery::Abandoned(waiter.id),
        }
    }

    /// Deregister a listener whose command was never issued, or one of a
    /// shared group that no longer waits
    pub(crate) fn withdraw(&self, id: OperationId) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|waiter| waiter.id != id);
        queue.len() != before
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<T: Clone> Waiters<T> {
    /// Hand `value` to every registration; returns how many were still listening
    pub(crate) fn resolve_all(&self, value: T) -> usize {
        let drained: Vec<Waiter<T>> = self.queue.lock().drain(..).collect();
        drained
            .into_iter()
            .filter_map(|waiter| waiter.tx.send(value.clone()).ok())
            .count()
    }
}

/// Receiving half of a registration
#[derive(Debug)]
pub(crate) struct Pending<T> {
    id: OperationId,
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    /// Wait for the matching event; `None` if the owning session was torn down
    pub(crate) async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }

    /// Wait at most `limit` (`None` waits indefinitely)
    ///
    /// On timeout the registration stays queued as an abandoned slot, so the
    /// late reply is discarded with it. Shared registrations withdraw it.
    pub(crate) async fn wait_timeout(
        self,
        limit: Option<Duration>,
        operation: &'static str,
    ) -> Result<T, SessionError> {
        let outcome = match limit {
            Some(limit) => tokio::time::timeout(limit, self.wait())
                .await
                .map_err(|_| SessionError::OperationTimedOut(operation))?,
            None => self.wait().await,
        };
        outcome.ok_or(SessionError::SessionNotAvailable)
    }
}
