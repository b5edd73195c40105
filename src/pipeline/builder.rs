//! Fluent construction of linear pipelines.
//!
//! A pipeline is declared source-first and wired lazily: each builder step
//! captures a closure that, at run time, receives the upstream pipe and
//! produces its own. Types flow through the chain, so a stage whose input
//! type does not match the upstream output fails to compile.
//!
//! The general DAG scheduler is an external collaborator; this builder
//! covers the single-branch shape `source → transforms → sink`, which is
//! also what the engine's own tests and demos exercise.

use std::sync::Arc;

use crate::config::{EngineConfig, ParallelOptions, RetryOptions};
use crate::error::{FailureKind, StageFailure};
use crate::metrics::{MetricsSink, with_current_stage};
use crate::pipe::{PipeReceiver, SendEnd, pipe};
use crate::retry::{ErrorHandler, FailFast};
use crate::stage::{Sink, Source, Transform};
use crate::strategy::{
    ExecutionStrategy, ParallelStrategy, SequentialStrategy, StageHandle, StageOutcome,
    StageStatus, StateCell, StrategyState,
};
use crate::types::StageId;

use super::runner::{Pipeline, RunWiring};

/// Entry point for declaring a pipeline.
///
/// # Examples
///
/// ```rust,no_run
/// use pipewright::config::ParallelOptions;
/// use pipewright::error::ItemError;
/// use pipewright::pipeline::PipelineBuilder;
/// use pipewright::stage::{CollectSink, FnTransform, IterSource};
///
/// # async fn example() -> Result<(), pipewright::error::PipelineError> {
/// let sink = CollectSink::new();
/// let collected = sink.items();
///
/// let report = PipelineBuilder::new("double")
///     .source("numbers", IterSource::new(0u64..10))
///     .parallel(
///         "double",
///         FnTransform::new(|x: &u64| -> Result<u64, ItemError> { Ok(x * 2) }),
///         ParallelOptions::default()
///             .with_max_degree_of_parallelism(4)
///             .with_preserve_ordering(true),
///     )
///     .sink("collect", sink)
///     .run()
///     .await?;
///
/// assert!(report.completed());
/// assert_eq!(collected.lock().len(), 10);
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    name: String,
    config: EngineConfig,
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: EngineConfig::default(),
            sinks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a metrics sink; snapshots from every stage in the run flow
    /// into it.
    #[must_use]
    pub fn with_metrics_sink<S: MetricsSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Declare the source stage and start the typed chain.
    pub fn source<T, S>(self, id: impl Into<StageId>, source: S) -> StageChain<T>
    where
        T: Send + 'static,
        S: Source<T> + 'static,
    {
        let id = id.into();
        StageChain {
            name: self.name,
            config: self.config,
            sinks: self.sinks,
            wire: Box::new(move |wiring| spawn_source(wiring, id, source)),
        }
    }
}

/// A partially built pipeline whose most recent stage emits `T`.
pub struct StageChain<T> {
    name: String,
    config: EngineConfig,
    sinks: Vec<Box<dyn MetricsSink>>,
    wire: Box<dyn FnOnce(&mut RunWiring) -> PipeReceiver<T> + Send>,
}

impl<T> StageChain<T>
where
    T: Send + Sync + 'static,
{
    /// Append a sequential transform (the default strategy) with no retry.
    pub fn transform<U, X>(self, id: impl Into<StageId>, transform: X) -> StageChain<U>
    where
        U: Send + 'static,
        X: Transform<T, U> + 'static,
    {
        self.transform_with(id, transform, RetryOptions::default(), Arc::new(FailFast))
    }

    /// Append a sequential transform with a retry budget and error
    /// handler.
    pub fn transform_with<U, X>(
        self,
        id: impl Into<StageId>,
        transform: X,
        retry: RetryOptions,
        handler: Arc<dyn ErrorHandler<T>>,
    ) -> StageChain<U>
    where
        U: Send + 'static,
        X: Transform<T, U> + 'static,
    {
        let id = id.into();
        let prev = self.wire;
        StageChain {
            name: self.name,
            config: self.config,
            sinks: self.sinks,
            wire: Box::new(move |wiring| {
                let input = prev(wiring);
                let ctx = wiring.stage_context(id);
                let strategy = SequentialStrategy::new()
                    .with_retry(retry)
                    .with_error_handler(handler);
                let (output, handle) = strategy.execute(input, Arc::new(transform), ctx);
                wiring.push_handle(handle);
                output
            }),
        }
    }

    /// Append a parallel transform using the run configuration's default
    /// options (see [`EngineConfig::default_parallel`]).
    pub fn parallel_default<U, X>(self, id: impl Into<StageId>, transform: X) -> StageChain<U>
    where
        U: Send + Sync + 'static,
        X: Transform<T, U> + 'static,
    {
        let options = self.config.default_parallel.clone();
        self.parallel(id, transform, options)
    }

    /// Append a parallel transform with the given options, no retry, and
    /// the fail-fast handler.
    pub fn parallel<U, X>(
        self,
        id: impl Into<StageId>,
        transform: X,
        options: ParallelOptions,
    ) -> StageChain<U>
    where
        U: Send + Sync + 'static,
        X: Transform<T, U> + 'static,
    {
        self.parallel_with(id, transform, options, RetryOptions::default(), Arc::new(FailFast))
    }

    /// Append a parallel transform with full retry and error-handler
    /// control.
    pub fn parallel_with<U, X>(
        self,
        id: impl Into<StageId>,
        transform: X,
        options: ParallelOptions,
        retry: RetryOptions,
        handler: Arc<dyn ErrorHandler<T>>,
    ) -> StageChain<U>
    where
        U: Send + Sync + 'static,
        X: Transform<T, U> + 'static,
    {
        let id = id.into();
        let prev = self.wire;
        StageChain {
            name: self.name,
            config: self.config,
            sinks: self.sinks,
            wire: Box::new(move |wiring| {
                let input = prev(wiring);
                let ctx = wiring.stage_context(id);
                let strategy = ParallelStrategy::new(options)
                    .with_retry(retry)
                    .with_error_handler(handler);
                let (output, handle) = strategy.execute(input, Arc::new(transform), ctx);
                wiring.push_handle(handle);
                output
            }),
        }
    }

    /// Terminate the chain with a sink, producing a runnable [`Pipeline`].
    pub fn sink<K>(self, id: impl Into<StageId>, sink: K) -> Pipeline
    where
        K: Sink<T> + 'static,
    {
        let id = id.into();
        let prev = self.wire;
        Pipeline {
            name: self.name,
            config: self.config,
            sinks: self.sinks,
            launch: Box::new(move |wiring| {
                let input = prev(wiring);
                let handle = spawn_sink(wiring, id, sink, input);
                wiring.push_handle(handle);
            }),
        }
    }
}

fn spawn_source<T, S>(wiring: &mut RunWiring, id: StageId, mut source: S) -> PipeReceiver<T>
where
    T: Send + 'static,
    S: Source<T> + 'static,
{
    let ctx = wiring.stage_context(id.clone());
    let pipeline_cancel = ctx.cancel_token().clone();
    let stage_cancel = pipeline_cancel.child_token();
    let stage_ctx = ctx.scoped(stage_cancel.clone());
    let metrics = Arc::clone(stage_ctx.metrics());
    let state = StateCell::new(id.clone());
    state.transition(StrategyState::Running);

    let (tx, rx) = pipe(Some(wiring.source_buffer()));
    let task_state = Arc::clone(&state);
    let task = tokio::spawn(with_current_stage(id.clone(), async move {
        let metrics = Arc::clone(stage_ctx.metrics());
        let mut fatal: Option<StageFailure> = None;
        loop {
            let next = tokio::select! {
                next = source.next(&stage_ctx) => next,
                _ = stage_cancel.cancelled() => break,
            };
            match next {
                Ok(Some(item)) => {
                    metrics.record_enqueued();
                    match tx.send(item, &stage_cancel).await {
                        Ok(()) => {
                            metrics.record_succeeded();
                            metrics.record_processed();
                        }
                        Err(SendEnd::Disconnected) => {
                            // Downstream terminated; nothing left to feed.
                            stage_cancel.cancel();
                            break;
                        }
                        Err(SendEnd::Cancelled) => break,
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    metrics.record_failed();
                    fatal = Some(StageFailure {
                        stage: stage_ctx.stage_id().clone(),
                        kind: FailureKind::StageFatal,
                        cause: error,
                        attempts: None,
                        metrics: metrics.snapshot(),
                    });
                    stage_cancel.cancel();
                    break;
                }
            }
        }
        task_state.transition(StrategyState::Draining);
        drop(tx);

        let final_snapshot = metrics.snapshot();
        let status = if let Some(mut failure) = fatal {
            failure.metrics = final_snapshot.clone();
            task_state.transition(StrategyState::Faulted);
            StageStatus::Faulted(failure)
        } else if stage_cancel.is_cancelled() || pipeline_cancel.is_cancelled() {
            task_state.transition(StrategyState::Cancelled);
            StageStatus::Cancelled
        } else {
            StageStatus::Completed
        };
        stage_ctx.registry().emit(&final_snapshot);
        task_state.transition(StrategyState::Terminated);
        StageOutcome {
            status,
            metrics: final_snapshot,
        }
    }));

    wiring.push_handle(StageHandle::new(id, state, metrics, task));
    rx
}

fn spawn_sink<T, K>(
    wiring: &mut RunWiring,
    id: StageId,
    mut sink: K,
    input: PipeReceiver<T>,
) -> StageHandle
where
    T: Send + 'static,
    K: Sink<T> + 'static,
{
    let ctx = wiring.stage_context(id.clone());
    let pipeline_cancel = ctx.cancel_token().clone();
    let stage_cancel = pipeline_cancel.child_token();
    let stage_ctx = ctx.scoped(stage_cancel.clone());
    let metrics = Arc::clone(stage_ctx.metrics());
    let state = StateCell::new(id.clone());
    state.transition(StrategyState::Running);

    let task_state = Arc::clone(&state);
    let task = tokio::spawn(with_current_stage(id.clone(), async move {
        let metrics = Arc::clone(stage_ctx.metrics());
        let mut fatal: Option<StageFailure> = None;
        while let Some(item) = input.recv(&stage_cancel).await {
            metrics.record_enqueued();
            match sink.accept(item, &stage_ctx).await {
                Ok(()) => {
                    metrics.record_succeeded();
                    metrics.record_processed();
                }
                Err(error) => {
                    metrics.record_failed();
                    metrics.record_processed();
                    fatal = Some(StageFailure {
                        stage: stage_ctx.stage_id().clone(),
                        kind: FailureKind::StageFatal,
                        cause: error,
                        attempts: None,
                        metrics: metrics.snapshot(),
                    });
                    // A dead sink starves the whole branch; unwind the run.
                    stage_cancel.cancel();
                    pipeline_cancel.cancel();
                    break;
                }
            }
        }
        if fatal.is_none() && !stage_cancel.is_cancelled() {
            if let Err(error) = sink.flush(&stage_ctx).await {
                metrics.record_failed();
                fatal = Some(StageFailure {
                    stage: stage_ctx.stage_id().clone(),
                    kind: FailureKind::StageFatal,
                    cause: error,
                    attempts: None,
                    metrics: metrics.snapshot(),
                });
                pipeline_cancel.cancel();
            }
        }
        task_state.transition(StrategyState::Draining);

        let final_snapshot = metrics.snapshot();
        let status = if let Some(mut failure) = fatal {
            failure.metrics = final_snapshot.clone();
            task_state.transition(StrategyState::Faulted);
            StageStatus::Faulted(failure)
        } else if stage_cancel.is_cancelled() || pipeline_cancel.is_cancelled() {
            task_state.transition(StrategyState::Cancelled);
            StageStatus::Cancelled
        } else {
            StageStatus::Completed
        };
        stage_ctx.registry().emit(&final_snapshot);
        task_state.transition(StrategyState::Terminated);
        StageOutcome {
            status,
            metrics: final_snapshot,
        }
    }));

    StageHandle::new(id, state, metrics, task)
}
