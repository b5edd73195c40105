//! Pluggable output targets for metrics snapshots.

use std::any::type_name;
use std::fs::File;
use std::io::{self, Result as IoResult, Stdout, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;

use super::recorder::MetricsSnapshot;
use crate::telemetry::{PlainFormatter, TelemetryFormatter};

/// Abstraction over an output target that consumes metrics snapshots.
pub trait MetricsSink: Send + Sync {
    /// Handle one snapshot. The sink decides how to serialize/format it.
    ///
    /// Implementations may perform blocking I/O; the registry ticker runs
    /// off the worker hot path, so a slow sink delays only other sinks.
    fn record(&mut self, snapshot: &MetricsSnapshot) -> IoResult<()>;

    /// A stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// Stdout sink with optional formatting.
pub struct ConsoleSink<F: TelemetryFormatter = PlainFormatter> {
    handle: Stdout,
    formatter: F,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
            formatter: PlainFormatter::new(),
        }
    }
}

impl<F: TelemetryFormatter> ConsoleSink<F> {
    pub fn with_formatter(formatter: F) -> Self {
        Self {
            handle: io::stdout(),
            formatter,
        }
    }
}

impl<F: TelemetryFormatter> MetricsSink for ConsoleSink<F> {
    fn record(&mut self, snapshot: &MetricsSnapshot) -> IoResult<()> {
        let rendered = self.formatter.render_snapshot(snapshot);
        self.handle.write_all(rendered.as_bytes())?;
        self.handle.flush()
    }
}

/// In-memory sink for testing and snapshots-of-snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<ParkingMutex<Vec<MetricsSnapshot>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of everything captured so far. Callers inspect without holding
    /// the mutex.
    pub fn captured(&self) -> Vec<MetricsSnapshot> {
        self.entries.lock().clone()
    }

    /// Most recent snapshot per stage label, if any were captured.
    pub fn latest_for(&self, stage: &str) -> Option<MetricsSnapshot> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|s| s.stage.as_str() == stage)
            .cloned()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, snapshot: &MetricsSnapshot) -> IoResult<()> {
        self.entries.lock().push(snapshot.clone());
        Ok(())
    }

    fn name(&self) -> String {
        "MemorySink".to_string()
    }
}

/// JSON Lines (JSONL) sink for machine-readable metrics.
///
/// One JSON object per line, suitable for log aggregation systems and
/// automated assertions in integration environments.
pub struct JsonLinesSink {
    handle: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    pub fn new(handle: Box<dyn Write + Send + Sync>) -> Self {
        Self { handle }
    }

    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write snapshots to a file (created or truncated).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn to_file(path: impl AsRef<Path>) -> IoResult<Self> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl MetricsSink for JsonLinesSink {
    fn record(&mut self, snapshot: &MetricsSnapshot) -> IoResult<()> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(self.handle, "{}", json)?;
        self.handle.flush()
    }

    fn name(&self) -> String {
        "JsonLinesSink".to_string()
    }
}

/// Channel-based sink for streaming snapshots to async consumers.
///
/// Forwards each snapshot to a flume channel, letting dashboards or test
/// harnesses observe stage progress while a pipeline runs:
///
/// ```rust,no_run
/// use pipewright::metrics::{ChannelSink, MetricsRegistry};
///
/// let (tx, rx) = flume::unbounded();
/// let registry = MetricsRegistry::with_sinks(vec![Box::new(ChannelSink::new(tx))]);
///
/// tokio::spawn(async move {
///     while let Ok(snapshot) = rx.recv_async().await {
///         println!("{}: {} succeeded", snapshot.stage, snapshot.succeeded);
///     }
/// });
/// # drop(registry);
/// ```
///
/// If the receiver is dropped, `record` returns an error which the registry
/// logs without disturbing other sinks.
pub struct ChannelSink {
    tx: flume::Sender<MetricsSnapshot>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<MetricsSnapshot>) -> Self {
        Self { tx }
    }
}

impl MetricsSink for ChannelSink {
    fn record(&mut self, snapshot: &MetricsSnapshot) -> IoResult<()> {
        self.tx
            .send(snapshot.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }

    fn name(&self) -> String {
        "ChannelSink".to_string()
    }
}
