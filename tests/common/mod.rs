//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use pipewright::error::ItemError;
use pipewright::metrics::MetricsRegistry;
use pipewright::pipe::{PipeReceiver, pipe};
use pipewright::stage::{StageContext, Transform};
use pipewright::types::{RunId, StageId};

/// Fresh context backed by its own registry, for strategy-level tests.
pub fn test_ctx(name: &str) -> StageContext {
    StageContext::new(
        StageId::from(name),
        CancellationToken::new(),
        Arc::new(MetricsRegistry::new(RunId::generate())),
    )
}

/// Context observing the given token.
pub fn test_ctx_with_token(name: &str, cancel: CancellationToken) -> StageContext {
    StageContext::new(
        StageId::from(name),
        cancel,
        Arc::new(MetricsRegistry::new(RunId::generate())),
    )
}

/// Pipe pre-filled with `items` and already at end-of-stream.
pub async fn feed_pipe<T: Send + 'static>(items: Vec<T>) -> PipeReceiver<T> {
    let cancel = CancellationToken::new();
    let (tx, rx) = pipe(None);
    for item in items {
        tx.send(item, &cancel).await.expect("unbounded send");
    }
    rx
}

/// Drain a pipe to end-of-stream.
pub async fn collect<T>(rx: PipeReceiver<T>) -> Vec<T> {
    let cancel = CancellationToken::new();
    let mut out = Vec::new();
    while let Some(item) = rx.recv(&cancel).await {
        out.push(item);
    }
    out
}

/// Transform that doubles its input after an optional delay.
pub struct Doubler {
    pub delay: Duration,
}

impl Doubler {
    pub fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Transform<u64, u64> for Doubler {
    async fn process(&self, item: &u64, _ctx: &StageContext) -> Result<u64, ItemError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(item * 2)
    }

    fn process_eager(&self, item: &u64, _ctx: &StageContext) -> Option<Result<u64, ItemError>> {
        self.delay.is_zero().then(|| Ok(item * 2))
    }
}

/// Transform that fails a fixed number of times per distinct item before
/// succeeding with `item * 2`.
pub struct Flaky {
    failures_per_item: u32,
    seen: Mutex<FxHashMap<u64, u32>>,
}

impl Flaky {
    pub fn failing(failures_per_item: u32) -> Self {
        Self {
            failures_per_item,
            seen: Mutex::new(FxHashMap::default()),
        }
    }
}

#[async_trait]
impl Transform<u64, u64> for Flaky {
    async fn process(&self, item: &u64, _ctx: &StageContext) -> Result<u64, ItemError> {
        let mut seen = self.seen.lock();
        let count = seen.entry(*item).or_insert(0);
        if *count < self.failures_per_item {
            *count += 1;
            return Err(ItemError::msg(format!(
                "transient failure {count} for item {item}"
            )));
        }
        Ok(item * 2)
    }
}
