use std::sync::Arc;

use pipewright::config::{ParallelOptions, RetryOptions};
use pipewright::error::FailureKind;
use pipewright::retry::RetryAlways;
use pipewright::stage::Transform;
use pipewright::strategy::{ExecutionStrategy, ParallelStrategy};

mod common;
use common::{Flaky, collect, feed_pipe, test_ctx};

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    // Every item fails twice, then succeeds; budget allows two retries.
    let input = feed_pipe((0u64..10).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(2)
            .with_preserve_ordering(false),
    )
    .with_retry(RetryOptions::default().with_max_item_retries(2))
    .with_error_handler(Arc::new(RetryAlways));
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Flaky::failing(2));

    let (output, handle) = strategy.execute(input, transform, test_ctx("flaky"));
    let mut out = collect(output).await;
    let outcome = handle.join().await;

    out.sort_unstable();
    let expected: Vec<u64> = (0..10).map(|x| x * 2).collect();
    assert_eq!(out, expected);
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.metrics.items_with_retry, 10);
    assert_eq!(outcome.metrics.retry_events, 20);
    assert_eq!(outcome.metrics.max_item_retry_attempts, 2);
    assert_eq!(outcome.metrics.succeeded, 10);
    assert_eq!(outcome.metrics.failed, 0);
}

#[tokio::test]
async fn exhausted_budget_becomes_a_stage_fatal() {
    // Items need two retries but the budget allows one: the first item to
    // demand a third attempt faults the stage.
    let input = feed_pipe((0u64..10).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default().with_max_degree_of_parallelism(2),
    )
    .with_retry(RetryOptions::default().with_max_item_retries(1))
    .with_error_handler(Arc::new(RetryAlways));
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Flaky::failing(2));

    let ctx = test_ctx("flaky");
    let pipeline_token = ctx.cancel_token().clone();
    let (output, handle) = strategy.execute(input, transform, ctx);
    let _ = collect(output).await;
    let outcome = handle.join().await;

    let failure = outcome.status.failure().expect("stage faulted");
    // Exhaustion is reclassified: the surfaced kind is stage-fatal, the
    // reason lives on the cause chain.
    assert_eq!(failure.kind, FailureKind::StageFatal);
    assert!(failure.cause.message.contains("retry budget exhausted"));
    assert!(failure.cause.cause.is_some());
    assert_eq!(failure.attempts, Some(2));
    assert_eq!(failure.stage.as_str(), "flaky");
    // Stage-level fatality never cancels the pipeline token.
    assert!(!pipeline_token.is_cancelled());
}

#[tokio::test]
async fn skip_handler_drops_failing_items_and_continues() {
    let input = feed_pipe((0u64..6).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(2)
            .with_preserve_ordering(true),
    )
    .with_error_handler(Arc::new(pipewright::retry::SkipAll));
    // Items never recover, so every one is skipped.
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Flaky::failing(u32::MAX));

    let (output, handle) = strategy.execute(input, transform, test_ctx("skippy"));
    let out = collect(output).await;
    let outcome = handle.join().await;

    assert!(out.is_empty());
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.metrics.failed, 6);
    assert_eq!(outcome.metrics.succeeded, 0);
    assert_eq!(outcome.metrics.processed, 6);
}

#[tokio::test]
async fn fail_pipeline_verdict_cancels_the_shared_token() {
    let input = feed_pipe((0u64..10).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default().with_max_degree_of_parallelism(2),
    )
    .with_error_handler(Arc::new(
        |_: &pipewright::stage::StageContext,
         _: &u64,
         _: &pipewright::error::ItemError,
         _: u32| pipewright::retry::RetryDecision::FailPipeline,
    ));
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Flaky::failing(u32::MAX));

    let ctx = test_ctx("poison");
    let pipeline_token = ctx.cancel_token().clone();
    let (output, handle) = strategy.execute(input, transform, ctx);
    let _ = collect(output).await;
    let outcome = handle.join().await;

    let failure = outcome.status.failure().expect("stage faulted");
    assert_eq!(failure.kind, FailureKind::PipelineFatal);
    assert!(pipeline_token.is_cancelled());
}
