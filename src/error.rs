//! Error taxonomy for the execution engine.
//!
//! The engine distinguishes two layers of failure:
//!
//! 1. **Recoverable item failures** ([`ItemError`]): raised by a transform,
//!    source, or sink for a single item. These never cross a component
//!    boundary as raised errors; workers translate them into tagged results
//!    and route them through the retry controller.
//! 2. **Fatal failures** ([`StageFailure`], [`PipelineError`]): the outward
//!    surfaces raised by the strategy and the runner when a stage or the
//!    whole pipeline cannot continue. The first fatal wins; later fatals
//!    are logged and dropped so they never shadow the root cause.
//!
//! Queue overflow is deliberately absent: drops are observable flow control
//! counted in metrics, never errors. Cancellation is its own outcome and is
//! never charged to `failed`.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricsSnapshot;
use crate::types::StageId;

// ============================================================================
// Recoverable item failures
// ============================================================================

/// A recoverable failure while processing a single item.
///
/// Carries a message, an optional chained cause, and optional structured
/// details. This is what [`Transform::process`](crate::stage::Transform::process)
/// and the source/sink contracts raise; the retry controller decides what
/// happens next.
///
/// # Examples
///
/// ```rust
/// use pipewright::error::ItemError;
/// use serde_json::json;
///
/// let err = ItemError::msg("upstream returned 503")
///     .with_details(json!({"status": 503, "attempt_window_ms": 250}));
/// let wrapped = ItemError::msg("fetch failed").with_cause(err);
/// assert_eq!(wrapped.to_string(), "fetch failed");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ItemError>>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Default for ItemError {
    fn default() -> Self {
        ItemError {
            message: String::new(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ItemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

impl ItemError {
    pub fn msg<M: Into<String>>(m: M) -> Self {
        ItemError {
            message: m.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    /// Wrap any error type, preserving its rendered message as the cause.
    pub fn from_error<M: Into<String>>(message: M, source: &dyn std::error::Error) -> Self {
        ItemError {
            message: message.into(),
            cause: Some(Box::new(ItemError::msg(source.to_string()))),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: ItemError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

// ============================================================================
// Fatal surfaces
// ============================================================================

/// Classifies why a stage or pipeline stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A transform raised and the error handler (or the engine) declared the
    /// failure unrecoverable for this stage. A retry budget running out is
    /// reclassified to this kind, with the exhaustion recorded on the cause
    /// chain.
    StageFatal,
    /// The error handler asked for the whole pipeline to stop.
    PipelineFatal,
    /// Cooperative cancellation ended execution. Never charged to `failed`.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageFatal => write!(f, "stage fatal"),
            Self::PipelineFatal => write!(f, "pipeline fatal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outward-facing failure surface of a stage that terminated Faulted.
///
/// Reports the stage, the failure kind, the root cause with its chain
/// preserved, attempts consumed on the failing item (when one exists), and
/// the stage's final metrics snapshot, taken during teardown.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("stage '{stage}' failed ({kind}): {cause}")]
#[diagnostic(
    code(pipewright::stage::faulted),
    help("Inspect the root cause chain and the final metrics snapshot; `attempts` tells you how many tries the failing item consumed.")
)]
pub struct StageFailure {
    pub stage: StageId,
    pub kind: FailureKind,
    #[source]
    pub cause: ItemError,
    /// Attempts consumed on the failing item, when the failure is tied to
    /// one (retry exhaustion, handler verdicts). `None` for infrastructure
    /// failures such as a panicked stage task.
    pub attempts: Option<u32>,
    pub metrics: MetricsSnapshot,
}

impl StageFailure {
    /// Whether this failure asked the whole pipeline to unwind.
    #[must_use]
    pub fn is_pipeline_fatal(&self) -> bool {
        matches!(self.kind, FailureKind::PipelineFatal)
    }
}

/// Runner-level failure for a whole pipeline execution.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    /// A stage terminated Faulted; this carries the first fatal (later
    /// fatals were logged and dropped).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Stage(#[from] StageFailure),

    /// The run was cancelled through the caller's token before completion.
    #[error("pipeline '{pipeline}' cancelled")]
    #[diagnostic(
        code(pipewright::pipeline::cancelled),
        help("Cancellation is cooperative; in-flight items were discarded, not failed.")
    )]
    Cancelled { pipeline: String },
}
