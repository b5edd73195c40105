//! Per-run registry of stage metrics and the fan-out to sinks.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::recorder::{MetricsSnapshot, StageMetrics};
use super::sink::MetricsSink;
use crate::types::{RunId, StageId};

tokio::task_local! {
    /// Stage identity of the task currently executing, set by worker and
    /// stage tasks so code inside a transform can resolve its own metrics.
    static CURRENT_STAGE: StageId;
}

/// Run the given future with `stage` recorded as the ambient stage identity.
pub(crate) async fn with_current_stage<F>(stage: StageId, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_STAGE.scope(stage, fut).await
}

/// The stage identity of the calling task, if it was set by the engine.
///
/// Inside a transform this names the stage whose worker is executing the
/// call; outside engine tasks it returns `None`.
#[must_use]
pub fn current_stage() -> Option<StageId> {
    CURRENT_STAGE.try_with(|s| s.clone()).ok()
}

/// Registry of [`StageMetrics`] for one pipeline run, with pluggable sinks.
///
/// One registry exists per run (there is deliberately no process-wide
/// registry). Stages register themselves at execution start; snapshots are
/// addressable by stage id and are fanned out to every configured sink by
/// the per-stage tickers and the final flush.
///
/// ```text
/// Stage tasks
///     │ ticker / final flush
///     ▼
/// MetricsRegistry::emit
///     ├─────┬─────┬─────┐
///     ▼     ▼     ▼     ▼
/// Console JSONL Memory Channel
/// ```
pub struct MetricsRegistry {
    run: RunId,
    stages: RwLock<FxHashMap<StageId, Arc<StageMetrics>>>,
    sinks: Mutex<Vec<Box<dyn MetricsSink>>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new(run: RunId) -> Self {
        Self {
            run,
            stages: RwLock::new(FxHashMap::default()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        let registry = Self::new(RunId::generate());
        *registry.sinks.lock() = sinks;
        registry
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    pub fn add_sink<T: MetricsSink + 'static>(&self, sink: T) {
        self.add_sink_boxed(Box::new(sink));
    }

    pub fn add_sink_boxed(&self, sink: Box<dyn MetricsSink>) {
        self.sinks.lock().push(sink);
    }

    /// Register (or fetch) the metrics handle for a stage.
    pub fn register(&self, stage: StageId) -> Arc<StageMetrics> {
        if let Some(existing) = self.stages.read().get(&stage) {
            return Arc::clone(existing);
        }
        let mut stages = self.stages.write();
        Arc::clone(
            stages
                .entry(stage.clone())
                .or_insert_with(|| Arc::new(StageMetrics::new(stage, self.run))),
        )
    }

    #[must_use]
    pub fn get(&self, stage: &StageId) -> Option<Arc<StageMetrics>> {
        self.stages.read().get(stage).cloned()
    }

    /// Metrics handle for the stage of the calling task, if the call is
    /// executing inside an engine worker (see [`current_stage`]).
    #[must_use]
    pub fn current(&self) -> Option<Arc<StageMetrics>> {
        current_stage().and_then(|stage| self.get(&stage))
    }

    /// Snapshot every registered stage, ordered by stage id for stable
    /// output.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let stages = self.stages.read();
        let mut snapshots: Vec<_> = stages.values().map(|m| m.snapshot()).collect();
        snapshots.sort_by(|a, b| a.stage.cmp(&b.stage));
        snapshots
    }

    /// Fan one snapshot out to every sink. Sink failures are logged and do
    /// not disturb the remaining sinks.
    pub fn emit(&self, snapshot: &MetricsSnapshot) {
        let mut sinks = self.sinks.lock();
        for sink in sinks.iter_mut() {
            if let Err(err) = sink.record(snapshot) {
                tracing::warn!(
                    target: "pipewright::metrics",
                    sink = %sink.name(),
                    stage = %snapshot.stage,
                    error = %err,
                    "metrics sink failed to record snapshot"
                );
            }
        }
    }

    /// Emit a fresh snapshot of every registered stage to the sinks.
    pub fn flush(&self) {
        for snapshot in self.snapshot_all() {
            self.emit(&snapshot);
        }
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("run", &self.run)
            .field("stages", &self.stages.read().len())
            .field("sinks", &self.sinks.lock().len())
            .finish()
    }
}
