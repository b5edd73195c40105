use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pipewright::config::{ParallelOptions, RetryOptions};
use pipewright::error::{FailureKind, ItemError, PipelineError};
use pipewright::metrics::MemorySink;
use pipewright::pipeline::PipelineBuilder;
use pipewright::retry::{RetryAlways, RetryDecision};
use pipewright::stage::{CollectSink, FnTransform, IterSource, Sink, Source, StageContext};

mod common;
use common::{Doubler, Flaky};

fn double_fn() -> FnTransform<impl Fn(&u64) -> Result<u64, ItemError> + Send + Sync> {
    FnTransform::new(|x: &u64| -> Result<u64, ItemError> { Ok(x * 2) })
}

#[tokio::test]
async fn linear_pipeline_runs_to_completion() {
    let sink = CollectSink::new();
    let collected = sink.items();

    let report = PipelineBuilder::new("doubling")
        .source("numbers", IterSource::new(0u64..100))
        .transform("bump", double_fn())
        .parallel(
            "double-again",
            Doubler::instant(),
            ParallelOptions::default()
                .with_max_degree_of_parallelism(4)
                .with_max_queue_length(16)
                .with_preserve_ordering(true),
        )
        .sink("collect", sink)
        .run()
        .await
        .expect("pipeline completed");

    assert!(report.completed());
    assert!(!report.cancelled());
    let expected: Vec<u64> = (0..100).map(|x| x * 4).collect();
    assert_eq!(*collected.lock(), expected);

    let source_metrics = report.metrics("numbers").expect("source metrics");
    assert_eq!(source_metrics.succeeded, 100);
    let stage_metrics = report.metrics("double-again").expect("stage metrics");
    assert_eq!(stage_metrics.enqueued, 100);
    assert_eq!(stage_metrics.succeeded, 100);
    let sink_metrics = report.metrics("collect").expect("sink metrics");
    assert_eq!(sink_metrics.succeeded, 100);
}

#[tokio::test]
async fn retrying_stage_recovers_inside_a_pipeline() {
    let sink = CollectSink::new();
    let collected = sink.items();

    let report = PipelineBuilder::new("flaky-run")
        .source("numbers", IterSource::new(0u64..10))
        .parallel_with(
            "flaky",
            Flaky::failing(2),
            ParallelOptions::default()
                .with_max_degree_of_parallelism(2)
                .with_preserve_ordering(true),
            RetryOptions::default().with_max_item_retries(2),
            Arc::new(RetryAlways),
        )
        .sink("collect", sink)
        .run()
        .await
        .expect("pipeline completed");

    assert!(report.completed());
    assert_eq!(*collected.lock(), (0..10).map(|x| x * 2).collect::<Vec<_>>());
    let metrics = report.metrics("flaky").unwrap();
    assert_eq!(metrics.items_with_retry, 10);
    assert_eq!(metrics.retry_events, 20);
}

#[tokio::test]
async fn stage_failure_surfaces_as_the_pipeline_error() {
    let sink = CollectSink::<u64>::new();

    let err = PipelineBuilder::new("doomed")
        .source("numbers", IterSource::new(0u64..10))
        .parallel_with(
            "flaky",
            Flaky::failing(5),
            ParallelOptions::default().with_max_degree_of_parallelism(2),
            RetryOptions::default().with_max_item_retries(1),
            Arc::new(RetryAlways),
        )
        .sink("collect", sink)
        .run()
        .await
        .expect_err("pipeline failed");

    match err {
        PipelineError::Stage(failure) => {
            assert_eq!(failure.stage.as_str(), "flaky");
            assert_eq!(failure.kind, FailureKind::StageFatal);
            assert!(failure.cause.message.contains("retry budget exhausted"));
            assert_eq!(failure.attempts, Some(2));
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
}

#[tokio::test]
async fn fail_pipeline_verdict_unwinds_every_stage() {
    let sink = CollectSink::<u64>::new();

    let err = PipelineBuilder::new("poisoned")
        .source("numbers", IterSource::new(0u64..1000))
        .parallel_with(
            "poison",
            Flaky::failing(u32::MAX),
            ParallelOptions::default().with_max_degree_of_parallelism(2),
            RetryOptions::default(),
            Arc::new(|_: &StageContext, _: &u64, _: &ItemError, _: u32| {
                RetryDecision::FailPipeline
            }),
        )
        .sink("collect", sink)
        .run()
        .await
        .expect_err("pipeline failed");

    match err {
        PipelineError::Stage(failure) => {
            assert_eq!(failure.kind, FailureKind::PipelineFatal);
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
}

struct FailingSink;

#[async_trait]
impl Sink<u64> for FailingSink {
    async fn accept(&mut self, item: u64, _ctx: &StageContext) -> Result<(), ItemError> {
        if item >= 6 {
            return Err(ItemError::msg("disk full"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn sink_failure_fails_the_run() {
    let err = PipelineBuilder::new("full-disk")
        .source("numbers", IterSource::new(0u64..100))
        .transform("id", double_fn())
        .sink("write", FailingSink)
        .run()
        .await
        .expect_err("pipeline failed");

    match err {
        PipelineError::Stage(failure) => {
            assert_eq!(failure.stage.as_str(), "write");
            assert_eq!(failure.kind, FailureKind::StageFatal);
            assert_eq!(failure.cause.message, "disk full");
        }
        other => panic!("expected sink failure, got {other:?}"),
    }
}

struct SlowSource {
    next: u64,
}

#[async_trait]
impl Source<u64> for SlowSource {
    async fn next(&mut self, _ctx: &StageContext) -> Result<Option<u64>, ItemError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let value = self.next;
        self.next += 1;
        Ok(Some(value))
    }
}

#[tokio::test]
async fn caller_cancellation_resolves_the_run_as_cancelled() {
    let sink = CollectSink::new();
    let collected = sink.items();

    let pipeline = PipelineBuilder::new("endless")
        .source("ticks", SlowSource { next: 0 })
        .parallel(
            "double",
            Doubler::instant(),
            ParallelOptions::default()
                .with_max_degree_of_parallelism(2)
                .with_preserve_ordering(true),
        )
        .sink("collect", sink);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        canceller.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(2),
        pipeline.run_with_token(cancel),
    )
    .await
    .expect("run resolved promptly")
    .expect("cancellation is not a stage failure");

    assert!(report.cancelled());
    assert!(!report.completed());
    // Whatever made it through is a doubled prefix of the tick sequence.
    {
        let seen = collected.lock();
        for (i, value) in seen.iter().enumerate() {
            assert_eq!(*value, (i as u64) * 2);
        }
    }
    // Strict callers can promote cancellation to an error.
    assert!(matches!(
        report.into_result(),
        Err(PipelineError::Cancelled { .. })
    ));
}

#[tokio::test]
async fn stream_source_and_fn_sink_round_trip() {
    use pipewright::stage::{FnSink, StreamSource};
    use std::sync::atomic::{AtomicU64, Ordering};

    let source = StreamSource::new(async_stream::stream! {
        for i in 0u64..25 {
            yield i;
        }
    });
    let total = Arc::new(AtomicU64::new(0));
    let sum = Arc::clone(&total);

    let report = PipelineBuilder::new("streamed")
        .with_config(
            pipewright::config::EngineConfig::default()
                .with_source_buffer(4)
                .with_default_parallel(
                    ParallelOptions::default()
                        .with_max_degree_of_parallelism(3)
                        .with_preserve_ordering(true),
                ),
        )
        .source("stream", source)
        .parallel_default("double", Doubler::instant())
        .sink(
            "sum",
            FnSink::new(move |item: u64| {
                sum.fetch_add(item, Ordering::Relaxed);
                Ok(())
            }),
        )
        .run()
        .await
        .expect("pipeline completed");

    assert!(report.completed());
    assert_eq!(total.load(Ordering::Relaxed), (0..25).map(|x| x * 2).sum::<u64>());
}

#[tokio::test]
async fn metrics_sinks_receive_final_snapshots_for_every_stage() {
    let metrics_sink = MemorySink::new();
    let sink = CollectSink::new();

    PipelineBuilder::new("observed")
        .with_metrics_sink(metrics_sink.clone())
        .source("numbers", IterSource::new(0u64..10))
        .transform("double", double_fn())
        .sink("collect", sink)
        .run()
        .await
        .expect("pipeline completed");

    assert!(metrics_sink.latest_for("numbers").is_some());
    assert!(metrics_sink.latest_for("double").is_some());
    assert!(metrics_sink.latest_for("collect").is_some());
    assert_eq!(metrics_sink.latest_for("double").unwrap().succeeded, 10);
}
