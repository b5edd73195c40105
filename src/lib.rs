//! # Pipewright: Streaming Data-Pipeline Execution Engine
//!
//! Pipewright executes typed processing stages — sources, transforms,
//! sinks — connected by pipes, streaming items end-to-end with bounded
//! memory, per-stage concurrency, backpressure, ordered or unordered
//! delivery, per-item retry, cancellation, and pluggable metrics.
//!
//! ## Core Concepts
//!
//! - **Stages**: typed units of work implementing [`stage::Source`],
//!   [`stage::Transform`], or [`stage::Sink`]
//! - **Pipes**: lazy single-consumer sequences with end-of-stream and
//!   cancellation ([`pipe`])
//! - **Strategies**: how a transform consumes its input — sequential by
//!   default, or a worker pool with a bounded queue and optional ordered
//!   delivery ([`strategy`])
//! - **Retry**: per-item attempt budgets driven by a user-supplied error
//!   handler ([`retry`])
//! - **Metrics**: per-stage counters snapshotted to pluggable sinks
//!   ([`metrics`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipewright::config::ParallelOptions;
//! use pipewright::error::ItemError;
//! use pipewright::pipeline::PipelineBuilder;
//! use pipewright::stage::{CollectSink, FnTransform, IterSource};
//!
//! # async fn example() -> Result<(), pipewright::error::PipelineError> {
//! let sink = CollectSink::new();
//! let collected = sink.items();
//!
//! let report = PipelineBuilder::new("doubler")
//!     .source("numbers", IterSource::new(0u64..1_000))
//!     .parallel(
//!         "double",
//!         FnTransform::new(|x: &u64| -> Result<u64, ItemError> { Ok(x * 2) }),
//!         ParallelOptions::default()
//!             .with_max_degree_of_parallelism(8)
//!             .with_max_queue_length(64)
//!             .with_preserve_ordering(true),
//!     )
//!     .sink("collect", sink)
//!     .run()
//!     .await?;
//!
//! assert!(report.completed());
//! assert_eq!(collected.lock().len(), 1_000);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backpressure and Bounded Memory
//!
//! Every buffer in a stage is bounded when configured so: the input queue
//! by `max_queue_length` (with a Block / DropOldest / DropNewest overflow
//! policy), the output pipe and reorder holds by
//! `output_buffer_capacity`. A slow sink therefore suspends workers, which
//! stops queue consumption, which suspends the producer — backpressure
//! propagates upstream without unbounded growth anywhere.
//!
//! ## Error Handling
//!
//! Transforms raise [`error::ItemError`] for recoverable per-item
//! failures. A per-stage [`retry::ErrorHandler`] decides whether to retry
//! (bounded by [`config::RetryOptions`]), skip the item, fail the stage,
//! or fail the whole pipeline. Fatal failures surface as
//! [`error::StageFailure`] carrying the root-cause chain, attempts
//! consumed, and the stage's final metrics snapshot.
//!
//! ## Module Guide
//!
//! - [`pipeline`] - Fluent builder and runner for linear pipelines
//! - [`strategy`] - Sequential and parallel execution strategies
//! - [`stage`] - Source / Transform / Sink contracts and adapters
//! - [`queue`] - Bounded input queue with overflow policies
//! - [`reorder`] - Ordered delivery across unordered workers
//! - [`retry`] - Retry decisions, handlers, and budgets
//! - [`metrics`] - Counters, snapshots, registry, and sinks
//! - [`config`] - Stage options, retry budgets, workload presets
//! - [`telemetry`] - Text rendering and tracing setup

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipe;
pub mod pipeline;
pub mod queue;
pub mod reorder;
pub mod retry;
pub mod stage;
pub mod strategy;
pub mod telemetry;
pub mod types;

mod worker;
