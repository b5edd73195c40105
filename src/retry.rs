//! Per-item retry control.
//!
//! When a transform raises a recoverable failure, the worker hands the item
//! to the retry controller. The controller asks the user-supplied error
//! handler for a decision, enforces the retry budget, applies the optional
//! backoff delay, and records retry metrics. Retries are re-executed in
//! place on the same worker — an item is never re-enqueued, which keeps
//! per-item attempts serialized and the producer→queue→worker→output chain
//! free of back-edges.

use std::sync::Arc;

use crate::config::RetryOptions;
use crate::error::{FailureKind, ItemError};
use crate::metrics::StageMetrics;
use crate::stage::StageContext;

/// Verdict returned by an error handler for one failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-execute the transform for this item, in place.
    Retry,
    /// Drop this item and continue the stage.
    SkipItem,
    /// Give up on this stage; the surrounding scheduler decides downstream
    /// fate.
    FailStage,
    /// Give up on the whole pipeline; the shared token is cancelled.
    FailPipeline,
}

/// User-supplied policy deciding what to do with a failed item.
///
/// Called on the worker's critical path: implementations must be fast and
/// non-blocking. `attempts` is the number of retries already consumed for
/// the item (0 on the first failure).
///
/// Closures implement the trait directly:
///
/// ```rust
/// use pipewright::retry::{ErrorHandler, RetryDecision};
///
/// let handler = |attempts: u32| {
///     if attempts < 3 { RetryDecision::Retry } else { RetryDecision::SkipItem }
/// };
/// // closures over (ctx, item, error, attempts) work the same way; see
/// // the blanket impl below.
/// # let _ = handler;
/// ```
pub trait ErrorHandler<T>: Send + Sync {
    fn decide(
        &self,
        ctx: &StageContext,
        item: &T,
        error: &ItemError,
        attempts: u32,
    ) -> RetryDecision;
}

impl<T, F> ErrorHandler<T> for F
where
    F: Fn(&StageContext, &T, &ItemError, u32) -> RetryDecision + Send + Sync,
{
    fn decide(
        &self,
        ctx: &StageContext,
        item: &T,
        error: &ItemError,
        attempts: u32,
    ) -> RetryDecision {
        self(ctx, item, error, attempts)
    }
}

/// Handler that always retries (within the stage's retry budget).
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryAlways;

impl<T> ErrorHandler<T> for RetryAlways {
    fn decide(&self, _: &StageContext, _: &T, _: &ItemError, _: u32) -> RetryDecision {
        RetryDecision::Retry
    }
}

/// Handler that skips every failing item.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipAll;

impl<T> ErrorHandler<T> for SkipAll {
    fn decide(&self, _: &StageContext, _: &T, _: &ItemError, _: u32) -> RetryDecision {
        RetryDecision::SkipItem
    }
}

/// Handler that fails the stage on the first error. The engine default.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailFast;

impl<T> ErrorHandler<T> for FailFast {
    fn decide(&self, _: &StageContext, _: &T, _: &ItemError, _: u32) -> RetryDecision {
        RetryDecision::FailStage
    }
}

/// Resolution of a failed attempt after budget enforcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryVerdict {
    /// Re-execute now; the backoff delay (if any) has already elapsed.
    RetryNow,
    /// Drop the item and continue.
    Skip,
    /// The retry budget ran out. Surfaced as a stage-fatal failure with the
    /// exhaustion recorded on the cause chain.
    Exhausted,
    /// Stage (or pipeline) is done for, by explicit handler verdict.
    Fatal(FailureKind),
}

/// Cause-chain wrapper for a retry budget that ran out. `attempts` is the
/// retry count consumed when the next retry was refused.
pub(crate) fn exhaustion_error(attempts: u32, cause: ItemError) -> ItemError {
    ItemError::msg(format!(
        "retry budget exhausted after {} attempts",
        attempts + 1
    ))
    .with_cause(cause)
}

/// Enforces the retry budget around the user-supplied handler and records
/// retry metrics.
pub(crate) struct RetryController<T> {
    options: RetryOptions,
    handler: Arc<dyn ErrorHandler<T>>,
}

impl<T> RetryController<T> {
    pub fn new(options: RetryOptions, handler: Arc<dyn ErrorHandler<T>>) -> Self {
        Self { options, handler }
    }

    /// Resolve one failed attempt. `attempts` is the retry count consumed
    /// before this failure. On `RetryNow` the caller re-executes with
    /// `attempts + 1`.
    pub async fn resolve(
        &self,
        ctx: &StageContext,
        metrics: &StageMetrics,
        item: &T,
        error: &ItemError,
        attempts: u32,
    ) -> RetryVerdict {
        match self.handler.decide(ctx, item, error, attempts) {
            RetryDecision::Retry => {
                if attempts >= self.options.max_item_retries {
                    // Budget exhausted: the recoverable failure becomes a
                    // fatal stage error.
                    tracing::debug!(
                        target: "pipewright::retry",
                        stage = %ctx.stage_id(),
                        attempts,
                        cap = self.options.max_item_retries,
                        "retry budget exhausted"
                    );
                    return RetryVerdict::Exhausted;
                }
                let consumed = attempts + 1;
                metrics.record_retry(consumed);
                if let Some(backoff) = &self.options.backoff {
                    let delay = backoff.delay_for(consumed);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel_token().cancelled() => {
                            return RetryVerdict::Fatal(FailureKind::Cancelled);
                        }
                    }
                }
                RetryVerdict::RetryNow
            }
            RetryDecision::SkipItem => RetryVerdict::Skip,
            RetryDecision::FailStage => RetryVerdict::Fatal(FailureKind::StageFatal),
            RetryDecision::FailPipeline => RetryVerdict::Fatal(FailureKind::PipelineFatal),
        }
    }
}
