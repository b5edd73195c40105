//! Pipeline execution: launching wired stages and aggregating outcomes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::error::{PipelineError, StageFailure};
use crate::metrics::{MetricsRegistry, MetricsSink, MetricsSnapshot};
use crate::stage::StageContext;
use crate::strategy::{StageHandle, StageOutcome};
use crate::types::{RunId, StageId};

/// Mutable wiring state threaded through stage closures at launch.
pub(crate) struct RunWiring {
    cancel: CancellationToken,
    registry: Arc<MetricsRegistry>,
    handles: Vec<StageHandle>,
    source_buffer: usize,
}

impl RunWiring {
    pub fn stage_context(&self, stage: StageId) -> StageContext {
        StageContext::new(stage, self.cancel.clone(), Arc::clone(&self.registry))
    }

    pub fn push_handle(&mut self, handle: StageHandle) {
        self.handles.push(handle);
    }

    pub fn source_buffer(&self) -> usize {
        self.source_buffer
    }
}

/// A fully wired pipeline, ready to run.
///
/// Produced by [`PipelineBuilder`](super::PipelineBuilder); consumed by
/// [`run`](Pipeline::run). Each run mints a fresh [`RunId`], registry, and
/// set of stage tasks.
pub struct Pipeline {
    pub(crate) name: String,
    pub(crate) config: EngineConfig,
    pub(crate) sinks: Vec<Box<dyn MetricsSink>>,
    pub(crate) launch: Box<dyn FnOnce(&mut RunWiring) + Send>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute to completion with an internally owned cancellation token.
    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        self.run_with_token(CancellationToken::new()).await
    }

    /// Execute to completion, observing `cancel` as the pipeline-level
    /// token. Cancelling it unwinds every stage cooperatively; the run then
    /// resolves with a report whose stages show Cancelled outcomes.
    #[instrument(skip(self, cancel), fields(pipeline = %self.name), err)]
    pub async fn run_with_token(
        self,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let run = RunId::generate();
        let registry = Arc::new(MetricsRegistry::new(run));
        for sink in self.sinks {
            registry.add_sink_boxed(sink);
        }

        let mut wiring = RunWiring {
            cancel: cancel.clone(),
            registry,
            handles: Vec::new(),
            source_buffer: self.config.source_buffer,
        };
        (self.launch)(&mut wiring);

        let mut stages = Vec::with_capacity(wiring.handles.len());
        for handle in wiring.handles {
            let stage = handle.stage_id().clone();
            let outcome = handle.join().await;
            stages.push(StageReport { stage, outcome });
        }

        let report = PipelineReport {
            name: self.name,
            run,
            stages,
        };

        if let Some(first) = report.first_failure() {
            for later in report
                .stages
                .iter()
                .filter_map(|s| s.outcome.status.failure())
                .skip(1)
            {
                tracing::warn!(
                    target: "pipewright::pipeline",
                    pipeline = %report.name,
                    stage = %later.stage,
                    kind = %later.kind,
                    "additional stage failure shadowed by the first fatal"
                );
            }
            return Err(PipelineError::Stage(first.clone()));
        }

        Ok(report)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("name", &self.name).finish()
    }
}

/// Outcome of one stage within a finished run.
#[derive(Debug)]
pub struct StageReport {
    pub stage: StageId,
    pub outcome: StageOutcome,
}

/// Final report of a pipeline run: per-stage outcomes with their final
/// metrics snapshots.
#[derive(Debug)]
pub struct PipelineReport {
    pub name: String,
    pub run: RunId,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    /// Every stage completed normally.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.stages.iter().all(|s| s.outcome.status.is_completed())
    }

    /// At least one stage ended through cancellation.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.stages.iter().any(|s| s.outcome.status.is_cancelled())
    }

    /// Final metrics snapshot for the named stage.
    #[must_use]
    pub fn metrics(&self, stage: &str) -> Option<&MetricsSnapshot> {
        self.stages
            .iter()
            .find(|s| s.stage.as_str() == stage)
            .map(|s| &s.outcome.metrics)
    }

    /// The first fatal stage failure in wiring order, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&StageFailure> {
        self.stages
            .iter()
            .find_map(|s| s.outcome.status.failure())
    }

    /// Treat cancellation as an error, for callers that want completion or
    /// nothing.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        if self.cancelled() {
            return Err(PipelineError::Cancelled {
                pipeline: self.name,
            });
        }
        Ok(self)
    }
}
