//! Replay-last-value observables
//!
//! A [`StateRelay`] holds the current value of a piece of session state and
//! fans it out to any number of [`Observable`] subscribers. New subscribers see
//! the current value first, then live updates. Only the owning session writes.
//!
//! State relays coalesce: a slow subscriber only sees the latest value. Value
//! streams where every update matters (characteristic values) use an
//! [`EventRelay`] instead, whose [`Updates`] receive each published value in
//! order.

use std::fmt;
use std::sync::Arc;

use futures::{future, stream, Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

/// Updates buffered per subscriber before the oldest are skipped
const UPDATE_BUFFER: usize = 256;

/// Single-writer holder of a current value
#[derive(Debug)]
pub(crate) struct StateRelay<T> {
    tx: watch::Sender<T>,
}

impl<T> StateRelay<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> Observable<T> {
        Observable {
            rx: self.tx.subscribe(),
        }
    }

    /// Replace the value, waking subscribers even if it is unchanged
    pub(crate) fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate in place; subscribers are woken only when `f` reports a change
    pub(crate) fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.tx.send_if_modified(f)
    }
}

impl<T: PartialEq + Clone + Send + Sync + 'static> StateRelay<T> {
    /// Set only when the value differs
    pub(crate) fn set_if_changed(&self, value: T) -> bool {
        self.update(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

/// The relay has been dropped together with its owning session
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("observable source closed")]
pub struct SourceClosed;

/// Read side of a [`StateRelay`]
#[derive(Debug, Clone)]
pub struct Observable<T> {
    rx: watch::Receiver<T>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Value at this instant
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next update and return it
    ///
    /// Updates that land between two calls are coalesced; only the latest
    /// value is observed.
    pub async fn changed(&mut self) -> Result<T, SourceClosed> {
        self.rx.changed().await.map_err(|_| SourceClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Resolve with the first value (current included) matching `predicate`
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<T, SourceClosed>
    where
        F: FnMut(&T) -> bool,
    {
        let value = self
            .rx
            .wait_for(|value| predicate(value))
            .await
            .map_err(|_| SourceClosed)?;
        Ok(value.clone())
    }

    /// Current value followed by every observed update
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin + 'static {
        WatchStream::new(self.rx)
    }
}

/// Single-writer holder of a current value that also delivers every update
#[derive(Debug)]
pub(crate) struct EventRelay<T> {
    current: Arc<RwLock<T>>,
    tx: broadcast::Sender<T>,
}

impl<T> EventRelay<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(initial: T) -> Self {
        let (tx, _rx) = broadcast::channel(UPDATE_BUFFER);
        Self {
            current: Arc::new(RwLock::new(initial)),
            tx,
        }
    }

    pub(crate) fn get(&self) -> T {
        self.current.read().clone()
    }

    pub(crate) fn subscribe(&self) -> Updates<T> {
        // holding the lock keeps publish from slipping between snapshot and subscribe
        let current = self.current.read();
        Updates {
            current: self.current.clone(),
            last: current.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Store `value` and hand it to every subscriber
    pub(crate) fn publish(&self, value: T) {
        let mut current = self.current.write();
        *current = value.clone();
        // no subscribers is fine
        let _ = self.tx.send(value);
    }
}

/// Read side of an [`EventRelay`]
///
/// Starts from the value current at subscription and then yields every
/// published update in order.
pub struct Updates<T> {
    current: Arc<RwLock<T>>,
    last: T,
    rx: broadcast::Receiver<T>,
}

impl<T: fmt::Debug> fmt::Debug for Updates<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Updates")
            .field("last", &self.last)
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl<T> Updates<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Value at this instant
    pub fn current(&self) -> T {
        self.current.read().clone()
    }

    /// Wait for the next update not yet seen by this subscriber
    pub async fn changed(&mut self) -> Result<T, SourceClosed> {
        loop {
            match self.rx.recv().await {
                Ok(value) => {
                    self.last = value.clone();
                    return Ok(value);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Value subscriber fell behind, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SourceClosed),
            }
        }
    }

    /// Resolve with the first value (last seen included) matching `predicate`
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<T, SourceClosed>
    where
        F: FnMut(&T) -> bool,
    {
        if predicate(&self.last) {
            return Ok(self.last.clone());
        }
        loop {
            let value = self.changed().await?;
            if predicate(&value) {
                return Ok(value);
            }
        }
    }

    /// Last seen value followed by every later update
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin + 'static {
        let updates = BroadcastStream::new(self.rx).filter_map(|item| {
            future::ready(match item {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::warn!("Value stream fell behind: {}", error);
                    None
                }
            })
        });
        stream::once(future::ready(self.last)).chain(updates)
    }
}
