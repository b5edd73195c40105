use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use pipewright::config::ParallelOptions;
use pipewright::metrics::{
    ChannelSink, JsonLinesSink, MemorySink, MetricsRegistry, MetricsSink, MetricsSnapshot,
};
use pipewright::stage::{StageContext, Transform};
use pipewright::strategy::{ExecutionStrategy, ParallelStrategy};
use pipewright::types::{RunId, StageId};
use tokio_util::sync::CancellationToken;

mod common;
use common::{Doubler, collect, feed_pipe};

fn ctx_with_registry(name: &str, registry: Arc<MetricsRegistry>) -> StageContext {
    StageContext::new(StageId::from(name), CancellationToken::new(), registry)
}

#[tokio::test]
async fn final_snapshot_is_flushed_on_completion() {
    let sink = MemorySink::new();
    let registry = Arc::new(MetricsRegistry::new(RunId::generate()));
    registry.add_sink(sink.clone());

    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(2)
            // No periodic ticker: only the final flush may emit.
            .with_metrics_interval(Duration::ZERO),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());
    let ctx = ctx_with_registry("final", Arc::clone(&registry));

    let (output, handle) = strategy.execute(feed_pipe((0u64..5).collect()).await, transform, ctx);
    let _ = collect(output).await;
    let outcome = handle.join().await;

    let captured = sink.captured();
    assert_eq!(captured.len(), 1, "exactly the final flush");
    assert_eq!(captured[0].succeeded, 5);
    assert_eq!(captured[0], outcome.metrics);
}

#[tokio::test]
async fn ticker_emits_periodic_snapshots() {
    let sink = MemorySink::new();
    let registry = Arc::new(MetricsRegistry::new(RunId::generate()));
    registry.add_sink(sink.clone());

    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(2)
            .with_metrics_interval(Duration::from_millis(20)),
    );
    let transform: Arc<dyn Transform<u64, u64>> =
        Arc::new(Doubler::slow(Duration::from_millis(10)));
    let ctx = ctx_with_registry("ticking", Arc::clone(&registry));

    let (output, handle) = strategy.execute(feed_pipe((0u64..30).collect()).await, transform, ctx);
    let _ = collect(output).await;
    handle.join().await;

    // ~150ms of work at a 20ms cadence plus the final flush.
    assert!(sink.captured().len() >= 2);
}

#[tokio::test]
async fn channel_sink_streams_snapshots() {
    let (tx, rx) = flume::unbounded();
    let registry = MetricsRegistry::new(RunId::generate());
    registry.add_sink(ChannelSink::new(tx));
    let metrics = registry.register(StageId::from("live"));
    metrics.record_succeeded();
    registry.flush();

    let snapshot = rx.recv_async().await.expect("snapshot");
    assert_eq!(snapshot.stage.as_str(), "live");
    assert_eq!(snapshot.succeeded, 1);
}

#[tokio::test]
async fn jsonl_sink_writes_one_object_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.jsonl");
    {
        let mut sink = JsonLinesSink::to_file(&path).unwrap();
        let registry = MetricsRegistry::new(RunId::generate());
        let a = registry.register(StageId::from("a"));
        a.record_enqueued();
        a.record_succeeded();
        sink.record(&a.snapshot()).unwrap();
        sink.record(&registry.register(StageId::from("b")).snapshot()).unwrap();
    }

    let mut contents = String::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: MetricsSnapshot = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.stage.as_str(), "a");
    assert_eq!(first.succeeded, 1);
}

#[tokio::test]
async fn transforms_observe_their_stage_identity() {
    use async_trait::async_trait;
    use pipewright::error::ItemError;
    use pipewright::metrics::current_stage;

    struct Probe;

    #[async_trait]
    impl Transform<u64, u64> for Probe {
        async fn process(&self, item: &u64, ctx: &StageContext) -> Result<u64, ItemError> {
            // The worker-scoped identity matches the stage, so metrics
            // lookups by stage id work from inside a transform.
            assert_eq!(current_stage().as_ref(), Some(ctx.stage_id()));
            let own = ctx.registry().current().expect("own metrics");
            assert_eq!(own.stage(), ctx.stage_id());
            Ok(*item)
        }
    }

    let strategy = ParallelStrategy::new(
        ParallelOptions::default().with_max_degree_of_parallelism(2),
    );
    let registry = Arc::new(MetricsRegistry::new(RunId::generate()));
    let ctx = ctx_with_registry("probed", registry);

    let (output, handle) = strategy.execute(
        feed_pipe((0u64..8).collect()).await,
        Arc::new(Probe) as Arc<dyn Transform<u64, u64>>,
        ctx,
    );
    let _ = collect(output).await;
    let outcome = handle.join().await;
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.metrics.succeeded, 8);
}

#[tokio::test]
async fn accounting_identity_holds_after_completion() {
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(4)
            .with_max_queue_length(8),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());
    let registry = Arc::new(MetricsRegistry::new(RunId::generate()));
    let ctx = ctx_with_registry("balanced", registry);

    let (output, handle) = strategy.execute(feed_pipe((0u64..200).collect()).await, transform, ctx);
    let _ = collect(output).await;
    let outcome = handle.join().await;

    let m = &outcome.metrics;
    assert_eq!(m.enqueued, m.succeeded + m.failed + m.dropped());
    assert_eq!(m.in_flight(), 0);
    assert_eq!(m.current_workers_busy, 0);
}
