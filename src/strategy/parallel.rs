//! The parallel execution strategy: bounded queue, worker pool, optional
//! reorder buffer, retry, cancellation, and metrics, glued into one stage.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{ExecutionStrategy, StageHandle, StageOutcome, StageStatus, StateCell, StrategyState};
use crate::config::{ParallelOptions, RetryOptions};
use crate::error::{FailureKind, ItemError, StageFailure};
use crate::metrics::{MetricsRegistry, StageMetrics, with_current_stage};
use crate::pipe::{PipeReceiver, pipe};
use crate::queue::{BoundedQueue, EnqueueOutcome, QueueEntry};
use crate::reorder::{ReorderBuffer, WorkerResult};
use crate::retry::{ErrorHandler, FailFast, RetryController};
use crate::stage::{StageContext, Transform};
use crate::types::{Seq, StageId};
use crate::worker::{FatalSlot, OutputRoute, WorkerShared, run_worker};

/// Worker-pool execution of a transform stage.
///
/// Construction is cheap; the strategy is a bundle of configuration. Each
/// [`execute`](ExecutionStrategy::execute) call wires a fresh queue, pool,
/// and output pipe:
///
/// ```text
/// upstream ─▶ producer ─▶ BoundedQueue ─▶ N workers ─▶ ReorderBuffer ─▶ output
///                                             │ (ordered only)
///                                          retry (in place)
/// ```
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pipewright::config::ParallelOptions;
/// use pipewright::strategy::{ExecutionStrategy, ParallelStrategy};
/// # use pipewright::error::ItemError;
/// # use pipewright::metrics::MetricsRegistry;
/// # use pipewright::pipe::pipe;
/// # use pipewright::stage::{FnTransform, StageContext, Transform};
/// # use pipewright::types::{RunId, StageId};
/// # use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let options = ParallelOptions::default()
///     .with_max_degree_of_parallelism(4)
///     .with_max_queue_length(8)
///     .with_preserve_ordering(true);
/// let strategy: ParallelStrategy<u64> = ParallelStrategy::new(options);
///
/// let registry = Arc::new(MetricsRegistry::new(RunId::generate()));
/// let ctx = StageContext::new(StageId::from("double"), CancellationToken::new(), registry);
/// let (tx, input) = pipe::<u64>(None);
/// let double: Arc<dyn Transform<u64, u64>> =
///     Arc::new(FnTransform::new(|x: &u64| -> Result<u64, ItemError> { Ok(x * 2) }));
///
/// let (output, handle) = strategy.execute(input, double, ctx);
/// # drop((tx, output, handle));
/// # }
/// ```
pub struct ParallelStrategy<In> {
    options: ParallelOptions,
    retry: RetryOptions,
    handler: Arc<dyn ErrorHandler<In>>,
}

impl<In> ParallelStrategy<In>
where
    In: Send + Sync + 'static,
{
    /// Strategy with the given options, no retry budget, and the
    /// fail-fast handler.
    #[must_use]
    pub fn new(options: ParallelOptions) -> Self {
        Self {
            options,
            retry: RetryOptions::default(),
            handler: Arc::new(FailFast),
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

    pub fn options(&self) -> &ParallelOptions {
        &self.options
    }
}

impl<In, Out> ExecutionStrategy<In, Out> for ParallelStrategy<In>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    fn execute(
        &self,
        input: PipeReceiver<In>,
        transform: Arc<dyn Transform<In, Out>>,
        ctx: StageContext,
    ) -> (PipeReceiver<Out>, StageHandle) {
        let stage_id = ctx.stage_id().clone();
        let metrics = Arc::clone(ctx.metrics());
        let registry = Arc::clone(ctx.registry());
        let pipeline_cancel = ctx.cancel_token().clone();
        let stage_cancel = pipeline_cancel.child_token();
        let worker_ctx = ctx.scoped(stage_cancel.clone());

        let state = StateCell::new(stage_id.clone());
        state.transition(StrategyState::Running);

        let queue = Arc::new(BoundedQueue::new(
            self.options.queue_capacity(),
            self.options.queue_policy,
            Arc::clone(&metrics),
        ));
        let (out_tx, out_rx) = pipe(self.options.output_capacity());
        let route = if self.options.preserve_ordering {
            OutputRoute::Ordered(Arc::new(ReorderBuffer::new(
                self.options.output_capacity(),
                out_tx,
            )))
        } else {
            OutputRoute::Direct(Arc::new(out_tx))
        };

        let shared = WorkerShared {
            queue: Arc::clone(&queue),
            transform,
            route: route.clone(),
            retry: Arc::new(RetryController::new(
                self.retry.clone(),
                Arc::clone(&self.handler),
            )),
            fatal: FatalSlot::new(),
            ctx: worker_ctx,
            pipeline_cancel: pipeline_cancel.clone(),
            stage_cancel: stage_cancel.clone(),
        };

        let producer = tokio::spawn(with_current_stage(
            stage_id.clone(),
            producer_loop(input, Arc::clone(&queue), route.clone(), stage_cancel.clone()),
        ));

        let mut workers = JoinSet::new();
        for worker_ix in 0..self.options.workers() {
            workers.spawn(with_current_stage(
                stage_id.clone(),
                run_worker(shared.clone(), worker_ix),
            ));
        }

        let ticker = spawn_ticker(
            self.options.metrics_interval,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );

        let fatal = shared.fatal.clone();
        let sentinel_state = Arc::clone(&state);
        let task = tokio::spawn(with_current_stage(
            stage_id.clone(),
            sentinel(SentinelParts {
                stage_id: stage_id.clone(),
                state: sentinel_state,
                producer,
                workers,
                queue,
                route,
                fatal,
                metrics: Arc::clone(&metrics),
                registry,
                pipeline_cancel,
                stage_cancel,
                ticker,
            }),
        ));

        (out_rx, StageHandle::new(stage_id, state, metrics, task))
    }
}

/// Reads the upstream pipe, assigns `seq` in upstream order, and feeds the
/// queue. Drops under the eviction policies are reported to the reorder
/// buffer so the emission frontier advances past them; they never fail the
/// stage.
async fn producer_loop<In, Out>(
    input: PipeReceiver<In>,
    queue: Arc<BoundedQueue<In>>,
    route: OutputRoute<Out>,
    cancel: CancellationToken,
) -> Seq
where
    In: Send + 'static,
    Out: Send + Sync + 'static,
{
    let mut seq: Seq = 0;
    while let Some(item) = input.recv(&cancel).await {
        let entry = QueueEntry::new(seq, item);
        seq += 1;
        match queue.enqueue(entry, &cancel).await {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::DisplacedOldest(displaced) => {
                submit_drop(&route, displaced.seq, &cancel).await;
            }
            EnqueueOutcome::Rejected(entry) => {
                if queue.is_closed() || cancel.is_cancelled() {
                    break;
                }
                submit_drop(&route, entry.seq, &cancel).await;
            }
        }
    }
    queue.close();
    seq
}

async fn submit_drop<Out>(route: &OutputRoute<Out>, seq: Seq, cancel: &CancellationToken)
where
    Out: Send + Sync + 'static,
{
    if let OutputRoute::Ordered(buffer) = route {
        let _ = buffer
            .submit(WorkerResult::Dropped { seq }, cancel)
            .await;
    }
}

fn spawn_ticker(
    period: std::time::Duration,
    registry: Arc<MetricsRegistry>,
    metrics: Arc<StageMetrics>,
) -> Option<(CancellationToken, JoinHandle<()>)> {
    if period.is_zero() {
        return None;
    }
    let token = CancellationToken::new();
    let ticker_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first emitted snapshot reflects one full period.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => registry.emit(&metrics.snapshot()),
                _ = ticker_token.cancelled() => break,
            }
        }
    });
    Some((token, handle))
}

struct SentinelParts<In, Out> {
    stage_id: StageId,
    state: Arc<StateCell>,
    producer: JoinHandle<Seq>,
    workers: JoinSet<()>,
    queue: Arc<BoundedQueue<In>>,
    route: OutputRoute<Out>,
    fatal: FatalSlot,
    metrics: Arc<StageMetrics>,
    registry: Arc<MetricsRegistry>,
    pipeline_cancel: CancellationToken,
    stage_cancel: CancellationToken,
    ticker: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Waits for the stage to quiesce, then runs the teardown protocol:
/// close the queue, drain workers, finish the reorder buffer, close the
/// output pipe, flush the final snapshot. The order is observable and runs
/// on every termination path.
async fn sentinel<In, Out>(mut parts: SentinelParts<In, Out>) -> StageOutcome
where
    In: Send + 'static,
    Out: Send + Sync + 'static,
{
    let producer_panicked = match parts.producer.await {
        Ok(produced) => {
            tracing::debug!(
                target: "pipewright::strategy",
                stage = %parts.stage_id,
                produced,
                "producer finished"
            );
            false
        }
        Err(join_err) => {
            parts.fatal.install(StageFailure {
                stage: parts.stage_id.clone(),
                kind: FailureKind::StageFatal,
                cause: ItemError::msg(format!("producer task panicked: {join_err}")),
                attempts: None,
                metrics: parts.metrics.snapshot(),
            });
            parts.stage_cancel.cancel();
            true
        }
    };
    if producer_panicked {
        parts.queue.close();
    }

    parts.state.transition(StrategyState::Draining);
    while parts.workers.join_next().await.is_some() {}

    // Teardown order is part of the contract: queue first, then the
    // reorder buffer, then the output pipe.
    parts.queue.close();
    if let OutputRoute::Ordered(buffer) = &parts.route {
        let _ = buffer.finish(&parts.stage_cancel).await;
    }
    drop(parts.route);

    if let Some((token, handle)) = parts.ticker.take() {
        token.cancel();
        let _ = handle.await;
    }

    let final_snapshot = parts.metrics.snapshot();
    let status = if let Some(mut failure) = parts.fatal.take() {
        failure.metrics = final_snapshot.clone();
        parts.state.transition(StrategyState::Faulted);
        StageStatus::Faulted(failure)
    } else if parts.stage_cancel.is_cancelled() || parts.pipeline_cancel.is_cancelled() {
        parts.state.transition(StrategyState::Cancelled);
        StageStatus::Cancelled
    } else {
        StageStatus::Completed
    };

    // Final flush happens before the stage reports Terminated, on every
    // path.
    parts.registry.emit(&final_snapshot);
    parts.state.transition(StrategyState::Terminated);
    let status_label = match &status {
        StageStatus::Completed => "completed",
        StageStatus::Faulted(_) => "faulted",
        StageStatus::Cancelled => "cancelled",
    };
    tracing::debug!(
        target: "pipewright::strategy",
        stage = %parts.stage_id,
        status = status_label,
        "stage terminated"
    );

    StageOutcome {
        status,
        metrics: final_snapshot,
    }
}
