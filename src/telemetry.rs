//! Text rendering for snapshots and failures, plus tracing setup.

use std::io::IsTerminal;

use crate::error::{ItemError, StageFailure};
use crate::metrics::MetricsSnapshot;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta / dark pink
pub const RESET_COLOR: &str = "\x1b[0m";

/// Color handling for rendered output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatterMode {
    /// Detect TTY capability on stderr.
    #[default]
    Auto,
    /// Always include ANSI color codes.
    Colored,
    /// Never include ANSI color codes.
    Plain,
}

impl FormatterMode {
    fn colored(self) -> bool {
        match self {
            Self::Auto => std::io::stderr().is_terminal(),
            Self::Colored => true,
            Self::Plain => false,
        }
    }
}

/// Renders metrics snapshots and stage failures for text sinks.
pub trait TelemetryFormatter: Send + Sync {
    fn render_snapshot(&self, snapshot: &MetricsSnapshot) -> String;
    fn render_failure(&self, failure: &StageFailure) -> String;
}

/// Line-oriented formatter with optional ANSI colors.
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(FormatterMode::Auto)
    }

    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.mode.colored() {
            format!("{color}{text}{RESET_COLOR}")
        } else {
            text.to_string()
        }
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn format_cause_chain(error: &ItemError, indent: usize, out: &mut Vec<String>) {
    if let Some(cause) = &error.cause {
        let indent_str = "  ".repeat(indent);
        out.push(format!("{indent_str}cause: {}", cause.message));
        format_cause_chain(cause, indent + 1, out);
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_snapshot(&self, snapshot: &MetricsSnapshot) -> String {
        let line = format!(
            "[{}] {} enq={} ok={} fail={} drop={}+{} retries={} depth={}/{} busy={}\n",
            snapshot.taken_at.format("%H:%M:%S%.3f"),
            snapshot.stage,
            snapshot.enqueued,
            snapshot.succeeded,
            snapshot.failed,
            snapshot.dropped_oldest,
            snapshot.dropped_newest,
            snapshot.retry_events,
            snapshot.current_queue_depth,
            snapshot.max_queue_depth_observed,
            snapshot.current_workers_busy,
        );
        self.paint(LINE_COLOR, &line)
    }

    fn render_failure(&self, failure: &StageFailure) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{} | {}",
            self.paint(CONTEXT_COLOR, failure.stage.as_str()),
            failure.kind
        ));
        lines.push(self.paint(LINE_COLOR, &format!("  error: {}", failure.cause.message)));
        let mut chain = Vec::new();
        format_cause_chain(&failure.cause, 1, &mut chain);
        for line in chain {
            lines.push(self.paint(LINE_COLOR, &format!("  {line}")));
        }
        if let Some(attempts) = failure.attempts {
            lines.push(self.paint(LINE_COLOR, &format!("  attempts: {attempts}")));
        }
        lines.push(self.paint(
            LINE_COLOR,
            &format!(
                "  metrics: enqueued={} succeeded={} failed={}",
                failure.metrics.enqueued, failure.metrics.succeeded, failure.metrics.failed
            ),
        ));
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// Install a tracing subscriber configured from `RUST_LOG`, falling back
/// to `pipewright=info`.
///
/// Convenience for binaries and demos; libraries embedding the engine
/// normally install their own subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pipewright=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
