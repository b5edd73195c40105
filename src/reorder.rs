//! Reorder buffer restoring upstream order across unordered workers.
//!
//! Used only when a stage requests ordered delivery. Workers resolve items
//! in completion order; the buffer holds out-of-order results keyed by
//! `seq` and emits them downstream in strictly increasing `seq` order.
//! Dropped and failed results are still submitted so the emission frontier
//! advances past them; they are never forwarded.
//!
//! Holds are bounded by the stage's output buffer capacity, with one
//! carve-out: a submission at the emission frontier (`seq == next_seq`) is
//! always admitted, because it is the only event that can free held
//! capacity. Blocking it would wedge the whole pool. Backpressure from a
//! slow consumer still applies on the drain path, through the bounded
//! output pipe.

use std::collections::BTreeMap;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::StageFailure;
use crate::pipe::{PipeSender, SendEnd};
use crate::types::Seq;

/// Resolution of one dequeued item, produced by a worker.
#[derive(Debug)]
pub enum WorkerResult<T> {
    /// The transform produced an output.
    Success { seq: Seq, out: T },
    /// The error handler skipped the item; nothing is forwarded.
    Dropped { seq: Seq },
    /// The item failed fatally. The failure is routed to the stage outcome
    /// separately; here it only advances the emission frontier.
    Failure { seq: Seq, failure: StageFailure },
}

impl<T> WorkerResult<T> {
    #[must_use]
    pub fn seq(&self) -> Seq {
        match self {
            Self::Success { seq, .. } | Self::Dropped { seq } | Self::Failure { seq, .. } => *seq,
        }
    }

    fn into_forwardable(self) -> Option<T> {
        match self {
            Self::Success { out, .. } => Some(out),
            Self::Dropped { .. } | Self::Failure { .. } => None,
        }
    }
}

struct State<T> {
    next_seq: Seq,
    held: BTreeMap<Seq, Option<T>>,
    out: Option<PipeSender<T>>,
}

/// Seq-keyed buffer that restores upstream order for the non-dropped
/// subset of a stage's items.
pub struct ReorderBuffer<T> {
    state: Mutex<State<T>>,
    space: Notify,
    capacity: Option<usize>,
}

impl<T> ReorderBuffer<T> {
    /// `capacity` bounds out-of-order holds; `None` means unbounded. The
    /// sender is dropped (signalling end-of-stream) by [`finish`].
    ///
    /// [`finish`]: ReorderBuffer::finish
    pub fn new(capacity: Option<usize>, out: PipeSender<T>) -> Self {
        Self {
            state: Mutex::new(State {
                next_seq: 0,
                held: BTreeMap::new(),
                out: Some(out),
            }),
            space: Notify::new(),
            capacity,
        }
    }

    /// Place one resolved result. Emits immediately (with any consecutive
    /// held successors) when the result sits at the emission frontier;
    /// otherwise holds it, suspending while the hold bound is exhausted.
    ///
    /// Emission happens under the internal async lock, which is what keeps
    /// the downstream `seq` sequence strictly increasing even with many
    /// workers submitting concurrently.
    pub async fn submit(
        &self,
        result: WorkerResult<T>,
        cancel: &CancellationToken,
    ) -> Result<(), SendEnd> {
        let seq = result.seq();
        let mut result = Some(result);
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            {
                let mut state = self.state.lock().await;
                if seq == state.next_seq {
                    let result = result.take().expect("result consumed once");
                    return self.drain_frontier(&mut state, result, cancel).await;
                }
                let can_hold = self.capacity.is_none_or(|c| state.held.len() < c);
                if can_hold {
                    let result = result.take().expect("result consumed once");
                    state.held.insert(seq, result.into_forwardable());
                    return Ok(());
                }
                // Register as a waiter while still holding the lock.
                // `notify_waiters` stores no permit and drains happen under
                // this lock, so a wakeup between unlock and first poll would
                // otherwise be lost.
                space.as_mut().enable();
            }
            tokio::select! {
                _ = &mut space => {}
                _ = cancel.cancelled() => return Err(SendEnd::Cancelled),
            }
        }
    }

    /// Emit any still-held consecutive prefix from the frontier, then close
    /// the output pipe. Called after the producer has signalled
    /// end-of-stream and every worker has quiesced. Idempotent.
    pub async fn finish(&self, cancel: &CancellationToken) -> Result<(), SendEnd> {
        let mut state = self.state.lock().await;
        let batch = Self::take_ready(&mut state);
        self.space.notify_waiters();
        let res = Self::send_batch(&state, batch, cancel).await;
        state.out = None;
        res
    }

    /// The next `seq` the buffer will emit.
    pub async fn frontier(&self) -> Seq {
        self.state.lock().await.next_seq
    }

    /// Out-of-order results currently held.
    pub async fn held(&self) -> usize {
        self.state.lock().await.held.len()
    }

    async fn drain_frontier(
        &self,
        state: &mut State<T>,
        result: WorkerResult<T>,
        cancel: &CancellationToken,
    ) -> Result<(), SendEnd> {
        let mut batch = Vec::new();
        if let Some(out) = result.into_forwardable() {
            batch.push(out);
        }
        state.next_seq += 1;
        batch.extend(Self::take_ready(state));
        self.space.notify_waiters();
        Self::send_batch(state, batch, cancel).await
    }

    fn take_ready(state: &mut State<T>) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(slot) = state.held.remove(&state.next_seq) {
            if let Some(out) = slot {
                ready.push(out);
            }
            state.next_seq += 1;
        }
        ready
    }

    async fn send_batch(
        state: &State<T>,
        batch: Vec<T>,
        cancel: &CancellationToken,
    ) -> Result<(), SendEnd> {
        let Some(out) = state.out.as_ref() else {
            return Ok(());
        };
        for item in batch {
            out.send(item, cancel).await?;
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for ReorderBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReorderBuffer")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
