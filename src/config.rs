//! Stage and engine configuration surfaces.
//!
//! [`ParallelOptions`] shapes a single parallel stage: worker count, queue
//! bounds and overflow policy, ordering, output buffering, and the metrics
//! snapshot cadence. [`RetryOptions`] bounds per-item retry. Presets in
//! [`WorkloadPreset`] size a stage from the machine's core count for the
//! common workload classes. [`EngineConfig`] carries run-wide defaults and
//! can resolve them from `PIPEWRIGHT_*` environment variables.

use std::time::Duration;

/// What a bounded queue does with a new entry when it is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OverflowPolicy {
    /// Suspend the producer until space frees. Backpressure propagates
    /// upstream through the blocked enqueue.
    #[default]
    Block,
    /// Evict the oldest queued entry to admit the new one. The eviction is
    /// counted, never treated as an error.
    DropOldest,
    /// Reject the new entry immediately. The rejection is counted, never
    /// treated as an error.
    DropNewest,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::DropOldest => write!(f, "drop-oldest"),
            Self::DropNewest => write!(f, "drop-newest"),
        }
    }
}

/// Configuration for one parallel stage.
///
/// Non-positive sizes have the permissive meaning the field documents:
/// a worker count at or below zero means one worker; a queue or buffer
/// capacity at or below zero means unbounded.
///
/// # Examples
///
/// ```rust
/// use pipewright::config::{OverflowPolicy, ParallelOptions};
///
/// let options = ParallelOptions::default()
///     .with_max_degree_of_parallelism(8)
///     .with_max_queue_length(64)
///     .with_queue_policy(OverflowPolicy::DropOldest)
///     .with_preserve_ordering(true);
/// assert_eq!(options.workers(), 8);
/// assert_eq!(options.queue_capacity(), Some(64));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelOptions {
    /// Number of workers; values ≤ 0 mean 1.
    pub max_degree_of_parallelism: i32,
    /// Capacity of the bounded input queue; values ≤ 0 mean unbounded.
    pub max_queue_length: i64,
    /// Overflow behaviour of the input queue.
    pub queue_policy: OverflowPolicy,
    /// If true, output order equals input order; otherwise first-finished
    /// wins.
    pub preserve_ordering: bool,
    /// Capacity of the output pipe; values ≤ 0 mean unbounded.
    pub output_buffer_capacity: i64,
    /// Period for snapshotting counters to the metrics sinks. Zero disables
    /// the periodic ticker (the final snapshot is still taken).
    pub metrics_interval: Duration,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 1,
            max_queue_length: 0,
            queue_policy: OverflowPolicy::Block,
            preserve_ordering: false,
            output_buffer_capacity: 0,
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl ParallelOptions {
    #[must_use]
    pub fn with_max_degree_of_parallelism(mut self, dop: i32) -> Self {
        self.max_degree_of_parallelism = dop;
        self
    }

    #[must_use]
    pub fn with_max_queue_length(mut self, len: i64) -> Self {
        self.max_queue_length = len;
        self
    }

    #[must_use]
    pub fn with_queue_policy(mut self, policy: OverflowPolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    #[must_use]
    pub fn with_preserve_ordering(mut self, preserve: bool) -> Self {
        self.preserve_ordering = preserve;
        self
    }

    #[must_use]
    pub fn with_output_buffer_capacity(mut self, capacity: i64) -> Self {
        self.output_buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Effective worker count: `max(1, max_degree_of_parallelism)`.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.max_degree_of_parallelism.max(1) as usize
    }

    /// Effective queue capacity; `None` means unbounded.
    #[must_use]
    pub fn queue_capacity(&self) -> Option<usize> {
        (self.max_queue_length > 0).then_some(self.max_queue_length as usize)
    }

    /// Effective output pipe capacity; `None` means unbounded.
    #[must_use]
    pub fn output_capacity(&self) -> Option<usize> {
        (self.output_buffer_capacity > 0).then_some(self.output_buffer_capacity as usize)
    }
}

/// Backoff applied between retry attempts of a single item.
///
/// Delays grow by `factor` per retry, are capped at `max_delay`, and get
/// multiplicative jitter in `[0.8, 1.2)` when `jitter` is set so that
/// concurrently failing workers do not re-attempt in lockstep.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffOptions {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffOptions {
    /// Delay before the retry that would bring the item to `attempts`
    /// consumed retries (1 for the first retry).
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(exp as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            use rand::Rng;
            capped * rand::rng().random_range(0.8..1.2)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry budget for a stage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryOptions {
    /// Per-item retry cap: an item is attempted at most
    /// `max_item_retries + 1` times. Exceeding the cap converts the failure
    /// into a fatal stage error.
    pub max_item_retries: u32,
    /// Restart budget a supervising scheduler may apply to a faulted stage.
    /// The engine itself never restarts a stage; it surfaces the failure
    /// with attempts consumed so a supervisor can spend this budget.
    pub max_node_restart_attempts: u32,
    /// Optional delay schedule between attempts. `None` retries
    /// immediately.
    pub backoff: Option<BackoffOptions>,
}

impl RetryOptions {
    #[must_use]
    pub fn with_max_item_retries(mut self, retries: u32) -> Self {
        self.max_item_retries = retries;
        self
    }

    #[must_use]
    pub fn with_max_node_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_node_restart_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Workload classes with core-count-derived stage sizing.
///
/// | Preset | DOP | Queue | Buffer | Policy |
/// |---|---|---|---|---|
/// | General | 2·cores | 4·cores | 8·cores | Block |
/// | CpuBound | cores | 2·cores | 4·cores | Block |
/// | IoBound | 4·cores | 8·cores | 16·cores | Block |
/// | NetworkBound | min(8·cores, 100) | 200 | 400 | Block |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadPreset {
    General,
    CpuBound,
    IoBound,
    NetworkBound,
}

fn cores() -> i64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1)
}

impl WorkloadPreset {
    /// Concrete options for this workload class on the current machine.
    #[must_use]
    pub fn options(self) -> ParallelOptions {
        let cores = cores();
        let (dop, queue, buffer) = match self {
            Self::General => (2 * cores, 4 * cores, 8 * cores),
            Self::CpuBound => (cores, 2 * cores, 4 * cores),
            Self::IoBound => (4 * cores, 8 * cores, 16 * cores),
            Self::NetworkBound => ((8 * cores).min(100), 200, 400),
        };
        ParallelOptions::default()
            .with_max_degree_of_parallelism(dop as i32)
            .with_max_queue_length(queue)
            .with_output_buffer_capacity(buffer)
            .with_queue_policy(OverflowPolicy::Block)
    }

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "cpu" | "cpu-bound" | "cpu_bound" => Some(Self::CpuBound),
            "io" | "io-bound" | "io_bound" => Some(Self::IoBound),
            "network" | "network-bound" | "network_bound" => Some(Self::NetworkBound),
            _ => None,
        }
    }
}

/// Run-wide defaults applied by the pipeline builder.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Options applied by stages added without their own
    /// (`parallel_default` in the builder).
    pub default_parallel: ParallelOptions,
    /// Buffer between a source and its first consumer.
    pub source_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_parallel: ParallelOptions::default(),
            source_buffer: 1024,
        }
    }
}

impl EngineConfig {
    /// Resolve defaults from the environment (`.env` aware):
    ///
    /// - `PIPEWRIGHT_WORKLOAD_PRESET` — one of `general`, `cpu`, `io`,
    ///   `network`; selects [`WorkloadPreset`] defaults.
    /// - `PIPEWRIGHT_SOURCE_BUFFER` — source pipe capacity.
    /// - `PIPEWRIGHT_METRICS_INTERVAL_MS` — snapshot cadence in
    ///   milliseconds; `0` disables the ticker.
    ///
    /// Unset or unparseable variables fall back to the built-in defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(preset) = std::env::var("PIPEWRIGHT_WORKLOAD_PRESET") {
            match WorkloadPreset::parse(&preset) {
                Some(preset) => config.default_parallel = preset.options(),
                None => tracing::warn!(
                    target: "pipewright::config",
                    preset = %preset,
                    "unrecognized workload preset; using defaults"
                ),
            }
        }
        if let Some(buffer) = read_env_number("PIPEWRIGHT_SOURCE_BUFFER") {
            config.source_buffer = buffer as usize;
        }
        if let Some(ms) = read_env_number("PIPEWRIGHT_METRICS_INTERVAL_MS") {
            config.default_parallel.metrics_interval = Duration::from_millis(ms);
        }
        config
    }

    #[must_use]
    pub fn with_default_parallel(mut self, options: ParallelOptions) -> Self {
        self.default_parallel = options;
        self
    }

    #[must_use]
    pub fn with_source_buffer(mut self, buffer: usize) -> Self {
        self.source_buffer = buffer.max(1);
        self
    }
}

fn read_env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                target: "pipewright::config",
                key,
                value = %raw,
                "ignoring unparseable environment override"
            );
            None
        }
    }
}
