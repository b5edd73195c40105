//! Bounded input queue with pluggable overflow policy.
//!
//! One producer feeds the queue in strictly increasing `seq` order; the
//! worker pool consumes it concurrently. FIFO order is preserved among
//! entries that survive the policy. Overflow under the drop policies is
//! observable flow control counted in metrics, never an error.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::OverflowPolicy;
use crate::metrics::StageMetrics;
use crate::types::Seq;

/// One queued item together with its ordering and retry bookkeeping.
#[derive(Debug)]
pub struct QueueEntry<T> {
    pub seq: Seq,
    pub item: T,
    /// Retries consumed so far; starts at 0 and is advanced by the retry
    /// controller, never by the queue.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> QueueEntry<T> {
    pub fn new(seq: Seq, item: T) -> Self {
        Self {
            seq,
            item,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Debug)]
pub enum EnqueueOutcome<T> {
    /// The entry was admitted.
    Accepted,
    /// The entry was admitted by evicting the oldest queued entry
    /// (DropOldest).
    DisplacedOldest(QueueEntry<T>),
    /// The entry was not admitted: the queue was full under DropNewest, or
    /// it was closed/cancelled while the caller was suspended. Callers
    /// distinguish via [`BoundedQueue::is_closed`] and the token.
    Rejected(QueueEntry<T>),
}

struct Inner<T> {
    entries: VecDeque<QueueEntry<T>>,
    closed: bool,
}

/// Single-producer/multi-consumer queue of [`QueueEntry`] with capacity and
/// overflow policy.
///
/// All suspension points (`enqueue` under Block, `dequeue` while empty)
/// observe the cancellation token. `close` is idempotent: after it,
/// `enqueue` rejects and `dequeue` drains the remaining entries before
/// signalling end.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: Option<usize>,
    policy: OverflowPolicy,
    metrics: Arc<StageMetrics>,
}

impl<T> BoundedQueue<T> {
    pub fn new(
        capacity: Option<usize>,
        policy: OverflowPolicy,
        metrics: Arc<StageMetrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity,
            policy,
            metrics,
        }
    }

    /// Offer one entry to the queue, applying the overflow policy when
    /// full.
    pub async fn enqueue(
        &self,
        entry: QueueEntry<T>,
        cancel: &CancellationToken,
    ) -> EnqueueOutcome<T> {
        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return EnqueueOutcome::Rejected(entry);
                }
                let full = self
                    .capacity
                    .is_some_and(|capacity| inner.entries.len() >= capacity);
                if !full {
                    self.push(&mut inner, entry);
                    return EnqueueOutcome::Accepted;
                }
                match self.policy {
                    OverflowPolicy::Block => {}
                    OverflowPolicy::DropNewest => {
                        self.metrics.record_enqueued();
                        self.metrics.record_dropped_newest();
                        return EnqueueOutcome::Rejected(entry);
                    }
                    OverflowPolicy::DropOldest => {
                        let displaced = inner
                            .entries
                            .pop_front()
                            .expect("full queue has a front entry");
                        self.push(&mut inner, entry);
                        self.metrics.record_dropped_oldest();
                        return EnqueueOutcome::DisplacedOldest(displaced);
                    }
                }
                // Register as a waiter while the state is still locked so a
                // `notify_waiters` from `close` between unlock and first
                // poll cannot be lost.
                space.as_mut().enable();
            }
            tokio::select! {
                _ = &mut space => {}
                _ = cancel.cancelled() => return EnqueueOutcome::Rejected(entry),
            }
        }
    }

    /// Take the oldest surviving entry, suspending while the queue is
    /// empty. Returns `None` once the queue is closed and drained, or when
    /// the token fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<QueueEntry<T>> {
        loop {
            let available = self.not_empty.notified();
            tokio::pin!(available);
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.entries.pop_front() {
                    self.metrics.set_queue_depth(inner.entries.len());
                    self.not_full.notify_one();
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
                available.as_mut().enable();
            }
            tokio::select! {
                _ = &mut available => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Close the queue. Idempotent; wakes every suspended producer and
    /// consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Entries currently queued.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn push(&self, inner: &mut Inner<T>, entry: QueueEntry<T>) {
        inner.entries.push_back(entry);
        self.metrics.record_enqueued();
        self.metrics.set_queue_depth(inner.entries.len());
        self.not_empty.notify_one();
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("depth", &inner.entries.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &inner.closed)
            .finish()
    }
}
