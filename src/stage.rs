//! Stage contracts: sources, transforms, sinks, and the execution context.
//!
//! A pipeline stage is one of three capability interfaces:
//!
//! - [`Source`] produces a lazy sequence of typed items with explicit
//!   end-of-stream.
//! - [`Transform`] maps one input type to one output type, one item at a
//!   time, raising [`ItemError`] for recoverable per-item failures.
//! - [`Sink`] consumes a sequence and terminates the branch.
//!
//! Each contract receives a [`StageContext`] carrying the stage identity,
//! the cancellation token, and the metrics handles. Implementations must
//! not assume serialization across workers: a transform may be invoked from
//! several workers concurrently (never for the same item; retries of an
//! item stay on one worker).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ItemError;
use crate::metrics::{MetricsRegistry, StageMetrics};
use crate::types::{RunId, StageId};

// ============================================================================
// Execution context
// ============================================================================

/// Execution context handed to every stage contract.
///
/// Cheap to clone; the engine derives worker-scoped contexts from it so
/// that cancellation observed inside a transform is the stage's own token.
#[derive(Clone)]
pub struct StageContext {
    stage_id: StageId,
    run: RunId,
    cancel: CancellationToken,
    metrics: Arc<StageMetrics>,
    registry: Arc<MetricsRegistry>,
}

impl StageContext {
    pub fn new(
        stage_id: StageId,
        cancel: CancellationToken,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        let metrics = registry.register(stage_id.clone());
        Self {
            stage_id,
            run: registry.run(),
            cancel,
            metrics,
            registry,
        }
    }

    pub fn stage_id(&self) -> &StageId {
        &self.stage_id
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    /// The cancellation token this context observes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Metrics handle for this stage.
    pub fn metrics(&self) -> &Arc<StageMetrics> {
        &self.metrics
    }

    /// Registry of every stage in this run, for cross-stage lookups.
    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Derive a context that observes `cancel` instead of the current
    /// token. Used by strategies to scope workers to the stage's child
    /// token.
    #[must_use]
    pub(crate) fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage_id", &self.stage_id)
            .field("run", &self.run)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Transform
// ============================================================================

/// A one-in, one-out processing step.
///
/// Two contracts are offered. The deferred contract ([`process`]) is the
/// general async path. The eager contract ([`process_eager`]) lets a
/// trivially synchronous transform complete without allocating a future;
/// workers offer each item to the eager contract first and fall back to
/// the deferred one when it declines.
///
/// Inputs are passed by reference so the engine can re-execute a failing
/// item in place during retry without requiring `Clone` on item types.
///
/// [`process`]: Transform::process
/// [`process_eager`]: Transform::process_eager
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use pipewright::error::ItemError;
/// use pipewright::stage::{StageContext, Transform};
///
/// struct Double;
///
/// #[async_trait]
/// impl Transform<u64, u64> for Double {
///     async fn process(&self, item: &u64, _ctx: &StageContext) -> Result<u64, ItemError> {
///         Ok(item * 2)
///     }
///
///     fn process_eager(&self, item: &u64, _ctx: &StageContext) -> Option<Result<u64, ItemError>> {
///         Some(Ok(item * 2))
///     }
/// }
/// ```
#[async_trait]
pub trait Transform<In, Out>: Send + Sync {
    /// Process one item, suspending as needed.
    async fn process(&self, item: &In, ctx: &StageContext) -> Result<Out, ItemError>;

    /// Synchronous fast path. Return `None` (the default) to decline and
    /// route the item through [`Transform::process`].
    fn process_eager(&self, item: &In, ctx: &StageContext) -> Option<Result<Out, ItemError>> {
        let _ = (item, ctx);
        None
    }
}

/// Adapter turning a synchronous closure into a [`Transform`].
///
/// The closure runs on the eager contract, so no future is allocated per
/// item.
pub struct FnTransform<F> {
    f: F,
}

impl<F> FnTransform<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for FnTransform<F>
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
    F: Fn(&In) -> Result<Out, ItemError> + Send + Sync,
{
    async fn process(&self, item: &In, _ctx: &StageContext) -> Result<Out, ItemError> {
        (self.f)(item)
    }

    fn process_eager(&self, item: &In, _ctx: &StageContext) -> Option<Result<Out, ItemError>> {
        Some((self.f)(item))
    }
}

/// Adapter turning an async closure into a [`Transform`].
pub struct AsyncFnTransform<F> {
    f: F,
}

impl<F> AsyncFnTransform<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for AsyncFnTransform<F>
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
    F: for<'a> Fn(&'a In) -> BoxFuture<'a, Result<Out, ItemError>> + Send + Sync,
{
    async fn process(&self, item: &In, _ctx: &StageContext) -> Result<Out, ItemError> {
        (self.f)(item).await
    }
}

// ============================================================================
// Source
// ============================================================================

/// Producer of a lazy, finite or infinite sequence of typed items.
///
/// End-of-stream is `Ok(None)`. A raised [`ItemError`] is fatal for the
/// source stage: sources own their retry internally if they want it.
#[async_trait]
pub trait Source<T>: Send {
    async fn next(&mut self, ctx: &StageContext) -> Result<Option<T>, ItemError>;
}

/// Source over any iterator.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

#[async_trait]
impl<I, T> Source<T> for IterSource<I>
where
    I: Iterator<Item = T> + Send,
    T: Send + 'static,
{
    async fn next(&mut self, _ctx: &StageContext) -> Result<Option<T>, ItemError> {
        Ok(self.iter.next())
    }
}

/// Source over any boxed [`Stream`](futures_util::Stream).
pub struct StreamSource<T> {
    stream: BoxStream<'static, T>,
}

impl<T> StreamSource<T> {
    pub fn new(stream: impl futures_util::Stream<Item = T> + Send + 'static) -> Self {
        Self {
            stream: stream.boxed(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Source<T> for StreamSource<T> {
    async fn next(&mut self, _ctx: &StageContext) -> Result<Option<T>, ItemError> {
        Ok(self.stream.next().await)
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Consumer terminating a pipeline branch.
///
/// A raised [`ItemError`] is fatal for the sink stage and, in a linear
/// pipeline, for the run.
#[async_trait]
pub trait Sink<T>: Send {
    async fn accept(&mut self, item: T, ctx: &StageContext) -> Result<(), ItemError>;

    /// Called once after the input sequence ends, before the stage reports
    /// completion.
    async fn flush(&mut self, ctx: &StageContext) -> Result<(), ItemError> {
        let _ = ctx;
        Ok(())
    }
}

/// Sink that collects everything into a shared vector. Intended for tests
/// and demos.
pub struct CollectSink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected items, valid after the sink itself
    /// has been moved into a pipeline.
    pub fn items(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for CollectSink<T> {
    async fn accept(&mut self, item: T, _ctx: &StageContext) -> Result<(), ItemError> {
        self.items.lock().push(item);
        Ok(())
    }
}

/// Sink over a closure, for side-effecting consumers.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, F> Sink<T> for FnSink<F>
where
    T: Send + 'static,
    F: FnMut(T) -> Result<(), ItemError> + Send,
{
    async fn accept(&mut self, item: T, _ctx: &StageContext) -> Result<(), ItemError> {
        (self.f)(item)
    }
}
