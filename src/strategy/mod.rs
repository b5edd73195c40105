//! Execution strategies: how a transform stage consumes its input pipe.
//!
//! A strategy takes the stage's input pipe and transform and returns the
//! output pipe plus a [`StageHandle`] resolving to the stage's outcome.
//! [`SequentialStrategy`] is the default: one item in, one item out, on a
//! single task. [`ParallelStrategy`] replaces it with a bounded input
//! queue, a worker pool, and an optional reorder buffer.
//!
//! Every strategy walks the same lifecycle:
//!
//! ```text
//! Idle → Running → Draining → Terminated
//!                      ↘ Faulted → Terminated
//!                      ↘ Cancelled → Terminated
//! ```
//!
//! and observes the same teardown order on every path: close the input
//! queue, wait for workers to drain, finish the reorder buffer, close the
//! output pipe, flush a final metrics snapshot.

mod parallel;
mod sequential;

pub use parallel::ParallelStrategy;
pub use sequential::SequentialStrategy;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{FailureKind, ItemError, StageFailure};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::pipe::PipeReceiver;
use crate::stage::{StageContext, Transform};
use crate::types::StageId;

/// Lifecycle phase of an executing stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyState {
    Idle,
    Running,
    Draining,
    Faulted,
    Cancelled,
    /// Absorbing: once terminated, a stage never transitions again.
    Terminated,
}

pub(crate) struct StateCell {
    stage: StageId,
    state: Mutex<StrategyState>,
}

impl StateCell {
    pub fn new(stage: StageId) -> Arc<Self> {
        Arc::new(Self {
            stage,
            state: Mutex::new(StrategyState::Idle),
        })
    }

    pub fn get(&self) -> StrategyState {
        *self.state.lock()
    }

    /// Move to `next` unless already Terminated. Repeated transitions to
    /// the current state are no-ops, which keeps teardown idempotent.
    pub fn transition(&self, next: StrategyState) {
        let mut state = self.state.lock();
        if *state == StrategyState::Terminated || *state == next {
            return;
        }
        tracing::debug!(
            target: "pipewright::strategy",
            stage = %self.stage,
            from = ?*state,
            to = ?next,
            "stage state transition"
        );
        *state = next;
    }
}

/// How a stage ended.
#[derive(Debug)]
pub enum StageStatus {
    /// Input closed and every in-flight item resolved.
    Completed,
    /// A fatal error terminated the stage; first fatal wins.
    Faulted(StageFailure),
    /// Cooperative cancellation ended the stage.
    Cancelled,
}

impl StageStatus {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Faulted(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Final report of one stage execution: status plus the final metrics
/// snapshot taken during teardown.
#[derive(Debug)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub metrics: MetricsSnapshot,
}

/// Handle to a live stage.
///
/// Dropping the handle does not stop the stage; cancellation goes through
/// the shared token. `join` resolves once teardown finished.
pub struct StageHandle {
    stage_id: StageId,
    state: Arc<StateCell>,
    metrics: Arc<StageMetrics>,
    task: JoinHandle<StageOutcome>,
}

impl StageHandle {
    pub(crate) fn new(
        stage_id: StageId,
        state: Arc<StateCell>,
        metrics: Arc<StageMetrics>,
        task: JoinHandle<StageOutcome>,
    ) -> Self {
        Self {
            stage_id,
            state,
            metrics,
            task,
        }
    }

    pub fn stage_id(&self) -> &StageId {
        &self.stage_id
    }

    /// Current lifecycle phase, for observation and tests.
    #[must_use]
    pub fn state(&self) -> StrategyState {
        self.state.get()
    }

    /// Wait for the stage to terminate and return its outcome.
    ///
    /// A panicked stage task is reported as a Faulted outcome rather than
    /// propagating the panic to the caller.
    pub async fn join(self) -> StageOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                tracing::error!(
                    target: "pipewright::strategy",
                    stage = %self.stage_id,
                    error = %join_err,
                    "stage task ended abnormally"
                );
                self.state.transition(StrategyState::Faulted);
                self.state.transition(StrategyState::Terminated);
                let metrics = self.metrics.snapshot();
                StageOutcome {
                    status: StageStatus::Faulted(StageFailure {
                        stage: self.stage_id,
                        kind: FailureKind::StageFatal,
                        cause: ItemError::msg(format!("stage task panicked: {join_err}")),
                        attempts: None,
                        metrics: metrics.clone(),
                    }),
                    metrics,
                }
            }
        }
    }
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle")
            .field("stage_id", &self.stage_id)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Capability interface of an execution strategy.
///
/// `execute` wires the stage and returns immediately; all work happens on
/// spawned tasks. The returned receiver is the stage's output pipe; the
/// handle resolves to the stage outcome after teardown.
pub trait ExecutionStrategy<In, Out>: Send + Sync {
    fn execute(
        &self,
        input: PipeReceiver<In>,
        transform: Arc<dyn Transform<In, Out>>,
        ctx: StageContext,
    ) -> (PipeReceiver<Out>, StageHandle);
}
