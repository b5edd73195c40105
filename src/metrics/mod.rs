//! Execution metrics: per-stage recorders, snapshots, and pluggable sinks.
//!
//! Every stage records counters and gauges into a [`StageMetrics`] handle
//! registered in the run's [`MetricsRegistry`]. A per-stage ticker emits
//! periodic [`MetricsSnapshot`]s to the registry's sinks while the stage
//! runs, and the engine flushes a final snapshot on every termination path
//! (completed, faulted, or cancelled) before the stage reports Terminated.
//!
//! Sinks mirror the shapes most consumers need: [`ConsoleSink`] for humans,
//! [`JsonLinesSink`] for log aggregation, [`MemorySink`] for tests, and
//! [`ChannelSink`] for live streaming.

mod recorder;
mod registry;
mod sink;

pub use recorder::{MetricsSnapshot, StageMetrics};
pub use registry::{MetricsRegistry, current_stage};
pub(crate) use registry::with_current_stage;
pub use sink::{ChannelSink, ConsoleSink, JsonLinesSink, MemorySink, MetricsSink};
