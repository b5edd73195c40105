//! Per-stage execution counters and the snapshot type emitted to sinks.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RunId, StageId};

/// Lock-free counters and gauges observed during stage execution.
///
/// One instance exists per stage per run, registered in the
/// [`MetricsRegistry`](super::MetricsRegistry). All counters are monotonic;
/// gauges (`current_*`, `max_*`) track instantaneous or high-water values.
///
/// Increment methods are relaxed atomics: the recorder is on the worker
/// hot path and tolerates momentarily stale reads in exchange for never
/// contending a lock.
#[derive(Debug)]
pub struct StageMetrics {
    stage: StageId,
    run: RunId,
    enqueued: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_newest: AtomicU64,
    retry_events: AtomicU64,
    items_with_retry: AtomicU64,
    max_item_retry_attempts: AtomicU64,
    current_queue_depth: AtomicU64,
    current_workers_busy: AtomicU64,
    max_queue_depth_observed: AtomicU64,
}

impl StageMetrics {
    pub fn new(stage: StageId, run: RunId) -> Self {
        Self {
            stage,
            run,
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped_oldest: AtomicU64::new(0),
            dropped_newest: AtomicU64::new(0),
            retry_events: AtomicU64::new(0),
            items_with_retry: AtomicU64::new(0),
            max_item_retry_attempts: AtomicU64::new(0),
            current_queue_depth: AtomicU64::new(0),
            current_workers_busy: AtomicU64::new(0),
            max_queue_depth_observed: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> &StageId {
        &self.stage
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_oldest(&self) {
        self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_newest(&self) {
        self.dropped_newest.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retry of an item. `attempts` is the retry count consumed
    /// so far for that item *after* this retry (1 for the first retry).
    pub fn record_retry(&self, attempts: u32) {
        self.retry_events.fetch_add(1, Ordering::Relaxed);
        if attempts == 1 {
            self.items_with_retry.fetch_add(1, Ordering::Relaxed);
        }
        self.max_item_retry_attempts
            .fetch_max(u64::from(attempts), Ordering::Relaxed);
    }

    /// Publish the instantaneous queue depth and fold it into the high-water
    /// mark.
    pub fn set_queue_depth(&self, depth: usize) {
        let depth = depth as u64;
        self.current_queue_depth.store(depth, Ordering::Relaxed);
        self.max_queue_depth_observed
            .fetch_max(depth, Ordering::Relaxed);
    }

    pub fn worker_busy(&self) {
        self.current_workers_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_idle(&self) {
        self.current_workers_busy.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Capture the current values as an immutable, timestamped snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stage: self.stage.clone(),
            run: self.run,
            taken_at: Utc::now(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            dropped_newest: self.dropped_newest.load(Ordering::Relaxed),
            retry_events: self.retry_events.load(Ordering::Relaxed),
            items_with_retry: self.items_with_retry.load(Ordering::Relaxed),
            max_item_retry_attempts: self.max_item_retry_attempts.load(Ordering::Relaxed),
            current_queue_depth: self.current_queue_depth.load(Ordering::Relaxed),
            current_workers_busy: self.current_workers_busy.load(Ordering::Relaxed),
            max_queue_depth_observed: self.max_queue_depth_observed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of a stage's metrics at one point in time.
///
/// Snapshots are what sinks receive, what failure surfaces embed, and what
/// the periodic ticker emits. They serialize cleanly to JSON for the
/// [`JsonLinesSink`](super::JsonLinesSink).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stage: StageId,
    pub run: RunId,
    pub taken_at: DateTime<Utc>,
    pub enqueued: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped_oldest: u64,
    pub dropped_newest: u64,
    pub retry_events: u64,
    pub items_with_retry: u64,
    pub max_item_retry_attempts: u64,
    pub current_queue_depth: u64,
    pub current_workers_busy: u64,
    pub max_queue_depth_observed: u64,
}

impl MetricsSnapshot {
    /// Total drops under either eviction policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_oldest + self.dropped_newest
    }

    /// Items that entered the stage but have not yet resolved to an
    /// outcome. Non-zero only while the stage is live or after a
    /// cancellation cut it short.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.succeeded + self.failed + self.dropped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_accounting_tracks_first_retry_and_high_water() {
        let m = StageMetrics::new(StageId::from("t"), RunId::generate());
        m.record_retry(1);
        m.record_retry(2);
        m.record_retry(1);
        let snap = m.snapshot();
        assert_eq!(snap.retry_events, 3);
        assert_eq!(snap.items_with_retry, 2);
        assert_eq!(snap.max_item_retry_attempts, 2);
    }

    #[test]
    fn queue_depth_high_water_is_monotonic() {
        let m = StageMetrics::new(StageId::from("t"), RunId::generate());
        m.set_queue_depth(3);
        m.set_queue_depth(7);
        m.set_queue_depth(2);
        let snap = m.snapshot();
        assert_eq!(snap.current_queue_depth, 2);
        assert_eq!(snap.max_queue_depth_observed, 7);
    }

    #[test]
    fn in_flight_accounts_for_unresolved_items() {
        let m = StageMetrics::new(StageId::from("t"), RunId::generate());
        for _ in 0..10 {
            m.record_enqueued();
        }
        for _ in 0..6 {
            m.record_succeeded();
        }
        m.record_failed();
        m.record_dropped_oldest();
        assert_eq!(m.snapshot().in_flight(), 2);
    }
}
