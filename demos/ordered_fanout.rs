//! Ordered fan-out: many workers, upstream order preserved downstream.
//!
//! Run with: `cargo run --example ordered_fanout`

use pipewright::config::ParallelOptions;
use pipewright::error::ItemError;
use pipewright::metrics::ConsoleSink;
use pipewright::pipeline::PipelineBuilder;
use pipewright::stage::{CollectSink, FnTransform, IterSource};
use pipewright::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<(), pipewright::error::PipelineError> {
    init_tracing();

    let sink = CollectSink::new();
    let collected = sink.items();

    let report = PipelineBuilder::new("ordered-fanout")
        .with_metrics_sink(ConsoleSink::default())
        .source("numbers", IterSource::new(0u64..32))
        .parallel(
            "square",
            FnTransform::new(|x: &u64| -> Result<u64, ItemError> { Ok(x * x) }),
            ParallelOptions::default()
                .with_max_degree_of_parallelism(8)
                .with_max_queue_length(16)
                .with_preserve_ordering(true),
        )
        .sink("collect", sink)
        .run()
        .await?;

    println!("completed: {}", report.completed());
    println!("squares: {:?}", &*collected.lock());
    Ok(())
}
