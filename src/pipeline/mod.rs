//! Linear pipeline assembly and execution.
//!
//! [`PipelineBuilder`] declares a typed `source → transforms → sink` chain;
//! [`Pipeline::run`] executes it to completion and yields a
//! [`PipelineReport`] with per-stage outcomes and final metrics. Transform
//! stages run under the sequential strategy by default and under the
//! parallel strategy when given [`ParallelOptions`](crate::config::ParallelOptions).

mod builder;
mod runner;

pub use builder::{PipelineBuilder, StageChain};
pub use runner::{Pipeline, PipelineReport, StageReport};
