//! Worker pool internals for the parallel strategy.
//!
//! Each worker is a tokio task looping dequeue → transform → submit. The
//! transform is offered the eager contract first and falls back to the
//! deferred one; recoverable failures are resolved by the retry controller
//! in place, on the same worker, so attempts for a single item never
//! interleave across workers. Exactly one result is produced per dequeued
//! item; no partial output from earlier attempts ever becomes visible.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{FailureKind, ItemError, StageFailure};
use crate::pipe::{PipeSender, SendEnd};
use crate::queue::{BoundedQueue, QueueEntry};
use crate::reorder::{ReorderBuffer, WorkerResult};
use crate::retry::{RetryController, RetryVerdict, exhaustion_error};
use crate::stage::{StageContext, Transform};

/// Where workers deliver resolved results.
pub(crate) enum OutputRoute<T> {
    /// Through the reorder buffer; upstream order is restored.
    Ordered(Arc<ReorderBuffer<T>>),
    /// Straight into the output pipe; completion order wins.
    Direct(Arc<PipeSender<T>>),
}

impl<T> Clone for OutputRoute<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Ordered(buf) => Self::Ordered(Arc::clone(buf)),
            Self::Direct(tx) => Self::Direct(Arc::clone(tx)),
        }
    }
}

/// First-fatal-wins slot shared by a stage's tasks.
///
/// The first installed failure becomes the stage's fatal error; later
/// fatals are logged at warn and dropped so they never shadow the root
/// cause.
#[derive(Clone)]
pub(crate) struct FatalSlot {
    inner: Arc<Mutex<Option<StageFailure>>>,
}

impl FatalSlot {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Install `failure` if the slot is empty. Returns whether it won.
    pub fn install(&self, failure: StageFailure) -> bool {
        let mut slot = self.inner.lock();
        match slot.as_ref() {
            None => {
                *slot = Some(failure);
                true
            }
            Some(first) => {
                tracing::warn!(
                    target: "pipewright::strategy",
                    stage = %failure.stage,
                    kind = %failure.kind,
                    error = %failure.cause,
                    first_kind = %first.kind,
                    "secondary fatal error dropped; first fatal wins"
                );
                false
            }
        }
    }

    pub fn take(&self) -> Option<StageFailure> {
        self.inner.lock().take()
    }
}

enum ItemOutcome<Out> {
    Out(Out),
    Skip,
    Fatal {
        kind: FailureKind,
        error: ItemError,
        attempts: u32,
    },
    Cancelled,
}

pub(crate) struct WorkerShared<In, Out> {
    pub queue: Arc<BoundedQueue<In>>,
    pub transform: Arc<dyn Transform<In, Out>>,
    pub route: OutputRoute<Out>,
    pub retry: Arc<RetryController<In>>,
    pub fatal: FatalSlot,
    /// Stage-scoped context; its token is the stage's child token.
    pub ctx: StageContext,
    /// Parent token cancelled only on pipeline-fatal verdicts.
    pub pipeline_cancel: CancellationToken,
    /// Stage token cancelled on any fatal verdict.
    pub stage_cancel: CancellationToken,
}

impl<In, Out> Clone for WorkerShared<In, Out> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            transform: Arc::clone(&self.transform),
            route: self.route.clone(),
            retry: Arc::clone(&self.retry),
            fatal: self.fatal.clone(),
            ctx: self.ctx.clone(),
            pipeline_cancel: self.pipeline_cancel.clone(),
            stage_cancel: self.stage_cancel.clone(),
        }
    }
}

/// Body of one worker task.
pub(crate) async fn run_worker<In, Out>(shared: WorkerShared<In, Out>, worker_ix: usize)
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
{
    let cancel = shared.stage_cancel.clone();
    let metrics = Arc::clone(shared.ctx.metrics());
    tracing::trace!(
        target: "pipewright::worker",
        stage = %shared.ctx.stage_id(),
        worker_ix,
        "worker started"
    );
    while let Some(mut entry) = shared.queue.dequeue(&cancel).await {
        metrics.worker_busy();
        tracing::trace!(
            target: "pipewright::worker",
            stage = %shared.ctx.stage_id(),
            seq = entry.seq,
            queue_wait_ms = chrono::Utc::now()
                .signed_duration_since(entry.enqueued_at)
                .num_milliseconds(),
            "item dequeued"
        );
        let outcome = process_entry(&shared, &mut entry).await;
        let seq = entry.seq;
        let submit = match outcome {
            ItemOutcome::Out(out) => {
                metrics.record_succeeded();
                metrics.record_processed();
                submit_result(&shared, WorkerResult::Success { seq, out }, &cancel).await
            }
            ItemOutcome::Skip => {
                // A skipped item failed processing; the stage moves on but
                // the failure stays visible in the counters.
                metrics.record_failed();
                metrics.record_processed();
                submit_result(&shared, WorkerResult::Dropped { seq }, &cancel).await
            }
            ItemOutcome::Fatal {
                kind,
                error,
                attempts,
            } => {
                metrics.record_failed();
                metrics.record_processed();
                let failure = StageFailure {
                    stage: shared.ctx.stage_id().clone(),
                    kind,
                    cause: error,
                    attempts: Some(attempts + 1),
                    metrics: metrics.snapshot(),
                };
                if shared.fatal.install(failure.clone()) {
                    if failure.is_pipeline_fatal() {
                        shared.pipeline_cancel.cancel();
                    }
                    shared.stage_cancel.cancel();
                }
                let _ = submit_result(&shared, WorkerResult::Failure { seq, failure }, &cancel)
                    .await;
                metrics.worker_idle();
                break;
            }
            ItemOutcome::Cancelled => {
                // The item stays unresolved: it is in-flight loss, not a
                // failure.
                metrics.worker_idle();
                break;
            }
        };
        metrics.worker_idle();
        if submit.is_err() {
            // Downstream went away or cancellation fired mid-submit; either
            // way this worker has nowhere to deliver.
            if matches!(submit, Err(SendEnd::Disconnected)) {
                shared.stage_cancel.cancel();
            }
            break;
        }
    }
    tracing::trace!(
        target: "pipewright::worker",
        stage = %shared.ctx.stage_id(),
        worker_ix,
        "worker exited"
    );
}

async fn process_entry<In, Out>(
    shared: &WorkerShared<In, Out>,
    entry: &mut QueueEntry<In>,
) -> ItemOutcome<Out>
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
{
    let cancel = &shared.stage_cancel;
    let metrics = shared.ctx.metrics();
    loop {
        if cancel.is_cancelled() {
            return ItemOutcome::Cancelled;
        }
        // Eager contract first: trivially synchronous transforms complete
        // without allocating a future.
        let attempt = match shared.transform.process_eager(&entry.item, &shared.ctx) {
            Some(result) => result,
            None => {
                tokio::select! {
                    result = shared.transform.process(&entry.item, &shared.ctx) => result,
                    _ = cancel.cancelled() => return ItemOutcome::Cancelled,
                }
            }
        };
        match attempt {
            Ok(out) => return ItemOutcome::Out(out),
            Err(error) => {
                let verdict = shared
                    .retry
                    .resolve(&shared.ctx, metrics, &entry.item, &error, entry.attempts)
                    .await;
                match verdict {
                    RetryVerdict::RetryNow => {
                        entry.attempts += 1;
                    }
                    RetryVerdict::Skip => return ItemOutcome::Skip,
                    RetryVerdict::Exhausted => {
                        // Reclassified: exhaustion is the reason, stage-fatal
                        // is the surfaced kind.
                        return ItemOutcome::Fatal {
                            kind: FailureKind::StageFatal,
                            error: exhaustion_error(entry.attempts, error),
                            attempts: entry.attempts,
                        };
                    }
                    RetryVerdict::Fatal(FailureKind::Cancelled) => return ItemOutcome::Cancelled,
                    RetryVerdict::Fatal(kind) => {
                        return ItemOutcome::Fatal {
                            kind,
                            error,
                            attempts: entry.attempts,
                        };
                    }
                }
            }
        }
    }
}

async fn submit_result<In, Out>(
    shared: &WorkerShared<In, Out>,
    result: WorkerResult<Out>,
    cancel: &CancellationToken,
) -> Result<(), SendEnd>
where
    Out: Send + 'static,
{
    match &shared.route {
        OutputRoute::Ordered(buffer) => buffer.submit(result, cancel).await,
        OutputRoute::Direct(tx) => match result {
            WorkerResult::Success { out, .. } => tx.send(out, cancel).await,
            WorkerResult::Dropped { .. } | WorkerResult::Failure { .. } => Ok(()),
        },
    }
}
