//! Load shedding under a slow stage: DropOldest keeps the freshest work.
//!
//! Run with: `cargo run --example drop_policies`

use std::time::Duration;

use async_trait::async_trait;
use pipewright::config::{OverflowPolicy, ParallelOptions};
use pipewright::error::ItemError;
use pipewright::metrics::ChannelSink;
use pipewright::pipeline::PipelineBuilder;
use pipewright::stage::{CollectSink, IterSource, StageContext, Transform};
use pipewright::telemetry::init_tracing;

struct SlowEcho;

#[async_trait]
impl Transform<u64, u64> for SlowEcho {
    async fn process(&self, item: &u64, _ctx: &StageContext) -> Result<u64, ItemError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(*item)
    }
}

#[tokio::main]
async fn main() -> Result<(), pipewright::error::PipelineError> {
    init_tracing();

    let (tx, rx) = flume::unbounded::<pipewright::metrics::MetricsSnapshot>();
    tokio::spawn(async move {
        while let Ok(snapshot) = rx.recv_async().await {
            println!(
                "[{}] depth={} dropped={}",
                snapshot.stage,
                snapshot.current_queue_depth,
                snapshot.dropped_oldest
            );
        }
    });

    let sink = CollectSink::new();
    let collected = sink.items();

    let report = PipelineBuilder::new("shedding")
        .with_metrics_sink(ChannelSink::new(tx))
        .source("firehose", IterSource::new(0u64..200))
        .parallel(
            "slow-echo",
            SlowEcho,
            ParallelOptions::default()
                .with_max_degree_of_parallelism(2)
                .with_max_queue_length(8)
                .with_queue_policy(OverflowPolicy::DropOldest)
                .with_metrics_interval(Duration::from_millis(50)),
        )
        .sink("collect", sink)
        .run()
        .await?;

    let survivors = collected.lock().len();
    let metrics = report.metrics("slow-echo").unwrap();
    println!(
        "{} of 200 items survived; {} displaced",
        survivors, metrics.dropped_oldest
    );
    Ok(())
}
