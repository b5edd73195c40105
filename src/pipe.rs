//! Typed pipes connecting stages.
//!
//! A pipe is a lazy, single-consumer sequence with explicit end-of-stream
//! and cancellation. End-of-stream is signalled by dropping the sender;
//! cancellation is observed at every suspension point through the shared
//! token. Bounded pipes are the backpressure mechanism between stages: a
//! slow consumer suspends the upstream sender rather than inflating memory.

use flume::{Receiver, Sender, TrySendError};
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

/// Why a pipe send did not deliver its item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendEnd {
    /// The receiver was dropped; the sequence has no consumer anymore.
    Disconnected,
    /// The shared token was cancelled while the send was suspended.
    Cancelled,
}

/// Producing half of a pipe.
///
/// Deliberately not `Clone`: each pipe carries one upstream sequence, and a
/// dropped sender is the end-of-stream signal.
#[derive(Debug)]
pub struct PipeSender<T> {
    tx: Sender<T>,
}

impl<T> PipeSender<T> {
    /// Deliver one item, suspending while the pipe is full.
    ///
    /// Observes `cancel` at the suspension point; a cancellation that fires
    /// mid-send resolves to [`SendEnd::Cancelled`] and the item is
    /// discarded with the rest of the in-flight work.
    pub async fn send(&self, item: T, cancel: &CancellationToken) -> Result<(), SendEnd> {
        // Fast path keeps the common uncontended send off the select
        // machinery.
        let item = match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(_)) => return Err(SendEnd::Disconnected),
            Err(TrySendError::Full(item)) => item,
        };
        tokio::select! {
            res = self.tx.send_async(item) => res.map_err(|_| SendEnd::Disconnected),
            _ = cancel.cancelled() => Err(SendEnd::Cancelled),
        }
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Consuming half of a pipe.
#[derive(Debug)]
pub struct PipeReceiver<T> {
    rx: Receiver<T>,
}

impl<T> PipeReceiver<T> {
    /// Receive the next item, suspending while the pipe is empty.
    ///
    /// Returns `None` on end-of-stream (all senders dropped and the pipe
    /// drained) or when `cancel` fires. Callers that need to distinguish
    /// the two ask the token.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            res = self.rx.recv_async() => res.ok(),
            _ = cancel.cancelled() => None,
        }
    }

    /// Non-suspending receive; `None` when the pipe is currently empty or
    /// closed.
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drain everything currently available without suspending. Mostly
    /// useful in tests and terminal sinks.
    pub fn drain(&self) -> Vec<T> {
        self.rx.drain().collect()
    }

    /// Adapt this receiver into a [`Stream`] for combinator-style
    /// consumption. The stream ends at end-of-stream; cancellation is the
    /// caller's concern at that point.
    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: 'static,
    {
        self.rx.into_stream()
    }
}

/// Create a pipe with the given capacity; `None` means unbounded.
#[must_use]
pub fn pipe<T>(capacity: Option<usize>) -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = match capacity {
        Some(capacity) => flume::bounded(capacity.max(1)),
        None => flume::unbounded(),
    };
    (PipeSender { tx }, PipeReceiver { rx })
}
