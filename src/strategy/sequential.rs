//! The default execution strategy: one item at a time, on one task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ExecutionStrategy, StageHandle, StageOutcome, StageStatus, StateCell, StrategyState};
use crate::config::RetryOptions;
use crate::error::{FailureKind, StageFailure};
use crate::metrics::with_current_stage;
use crate::pipe::{PipeReceiver, PipeSender, SendEnd, pipe};
use crate::retry::{ErrorHandler, FailFast, RetryController, RetryVerdict, exhaustion_error};
use crate::stage::{StageContext, Transform};

/// Single-task execution of a transform stage.
///
/// Items flow one at a time in upstream order, so ordering is inherent and
/// no queue or reorder machinery is involved. Retry runs in place exactly
/// as it does inside a parallel worker. This is the strategy a scheduler
/// selects when a stage carries no parallel options.
pub struct SequentialStrategy<In> {
    retry: RetryOptions,
    handler: Arc<dyn ErrorHandler<In>>,
    output_capacity: Option<usize>,
}

impl<In> SequentialStrategy<In>
where
    In: Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry: RetryOptions::default(),
            handler: Arc::new(FailFast),
            output_capacity: None,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler<In>>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn with_output_capacity(mut self, capacity: Option<usize>) -> Self {
        self.output_capacity = capacity;
        self
    }
}

impl<In> Default for SequentialStrategy<In>
where
    In: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> ExecutionStrategy<In, Out> for SequentialStrategy<In>
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
{
    fn execute(
        &self,
        input: PipeReceiver<In>,
        transform: Arc<dyn Transform<In, Out>>,
        ctx: StageContext,
    ) -> (PipeReceiver<Out>, StageHandle) {
        let stage_id = ctx.stage_id().clone();
        let metrics = Arc::clone(ctx.metrics());
        let pipeline_cancel = ctx.cancel_token().clone();
        let stage_cancel = pipeline_cancel.child_token();
        let stage_ctx = ctx.scoped(stage_cancel.clone());

        let state = StateCell::new(stage_id.clone());
        state.transition(StrategyState::Running);

        let (out_tx, out_rx) = pipe(self.output_capacity);
        let retry = RetryController::new(self.retry.clone(), Arc::clone(&self.handler));

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(with_current_stage(
            stage_id.clone(),
            run_sequential(SequentialParts {
                input,
                transform,
                retry,
                out_tx,
                ctx: stage_ctx,
                state: task_state,
                pipeline_cancel,
                stage_cancel,
            }),
        ));

        (out_rx, StageHandle::new(stage_id, state, metrics, task))
    }
}

struct SequentialParts<In, Out> {
    input: PipeReceiver<In>,
    transform: Arc<dyn Transform<In, Out>>,
    retry: RetryController<In>,
    out_tx: PipeSender<Out>,
    ctx: StageContext,
    state: Arc<StateCell>,
    pipeline_cancel: CancellationToken,
    stage_cancel: CancellationToken,
}

async fn run_sequential<In, Out>(parts: SequentialParts<In, Out>) -> StageOutcome
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
{
    let SequentialParts {
        input,
        transform,
        retry,
        out_tx,
        ctx,
        state,
        pipeline_cancel,
        stage_cancel,
    } = parts;
    let metrics = Arc::clone(ctx.metrics());
    let mut fatal: Option<StageFailure> = None;

    'stage: while let Some(item) = input.recv(&stage_cancel).await {
        metrics.record_enqueued();
        let mut attempts: u32 = 0;
        loop {
            if stage_cancel.is_cancelled() {
                break 'stage;
            }
            let attempt = match transform.process_eager(&item, &ctx) {
                Some(result) => result,
                None => {
                    tokio::select! {
                        result = transform.process(&item, &ctx) => result,
                        _ = stage_cancel.cancelled() => break 'stage,
                    }
                }
            };
            match attempt {
                Ok(out) => {
                    metrics.record_succeeded();
                    metrics.record_processed();
                    match out_tx.send(out, &stage_cancel).await {
                        Ok(()) => {}
                        Err(SendEnd::Disconnected) => {
                            stage_cancel.cancel();
                            break 'stage;
                        }
                        Err(SendEnd::Cancelled) => break 'stage,
                    }
                    break;
                }
                Err(error) => {
                    let resolved = retry.resolve(&ctx, &metrics, &item, &error, attempts).await;
                    let (kind, cause) = match resolved {
                        RetryVerdict::RetryNow => {
                            attempts += 1;
                            continue;
                        }
                        RetryVerdict::Skip => {
                            metrics.record_failed();
                            metrics.record_processed();
                            break;
                        }
                        RetryVerdict::Exhausted => (
                            FailureKind::StageFatal,
                            exhaustion_error(attempts, error),
                        ),
                        RetryVerdict::Fatal(FailureKind::Cancelled) => break 'stage,
                        RetryVerdict::Fatal(kind) => (kind, error),
                    };
                    metrics.record_failed();
                    metrics.record_processed();
                    let failure = StageFailure {
                        stage: ctx.stage_id().clone(),
                        kind,
                        cause,
                        attempts: Some(attempts + 1),
                        metrics: metrics.snapshot(),
                    };
                    if failure.is_pipeline_fatal() {
                        pipeline_cancel.cancel();
                    }
                    stage_cancel.cancel();
                    fatal = Some(failure);
                    break 'stage;
                }
            }
        }
    }

    state.transition(StrategyState::Draining);
    drop(out_tx);

    let final_snapshot = metrics.snapshot();
    let status = if let Some(mut failure) = fatal {
        failure.metrics = final_snapshot.clone();
        state.transition(StrategyState::Faulted);
        StageStatus::Faulted(failure)
    } else if stage_cancel.is_cancelled() || pipeline_cancel.is_cancelled() {
        state.transition(StrategyState::Cancelled);
        StageStatus::Cancelled
    } else {
        StageStatus::Completed
    };
    ctx.registry().emit(&final_snapshot);
    state.transition(StrategyState::Terminated);

    StageOutcome {
        status,
        metrics: final_snapshot,
    }
}
