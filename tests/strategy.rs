use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pipewright::config::{OverflowPolicy, ParallelOptions};
use pipewright::pipe::pipe;
use pipewright::stage::Transform;
use pipewright::strategy::{
    ExecutionStrategy, ParallelStrategy, SequentialStrategy, StrategyState,
};

mod common;
use common::{Doubler, collect, feed_pipe, test_ctx, test_ctx_with_token};

#[tokio::test]
async fn ordered_fan_out_preserves_input_order() {
    let input = feed_pipe((0u64..10).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(4)
            .with_max_queue_length(8)
            .with_queue_policy(OverflowPolicy::Block)
            .with_preserve_ordering(true),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());

    let (output, handle) = strategy.execute(input, transform, test_ctx("fanout"));
    let out = collect(output).await;
    let outcome = handle.join().await;

    let expected: Vec<u64> = (0..10).map(|x| x * 2).collect();
    assert_eq!(out, expected);
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.metrics.enqueued, 10);
    assert_eq!(outcome.metrics.succeeded, 10);
    assert_eq!(outcome.metrics.dropped(), 0);
}

#[tokio::test]
async fn stage_walks_the_lifecycle_states() {
    // Keep the upstream pipe open so the stage sits in Running.
    let token = CancellationToken::new();
    let (tx, input) = pipe::<u64>(None);
    tx.send(0, &token).await.unwrap();

    let strategy = ParallelStrategy::new(
        ParallelOptions::default().with_max_degree_of_parallelism(2),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());
    let (output, handle) = strategy.execute(input, transform, test_ctx("lifecycle"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), StrategyState::Running);

    drop(tx);
    let out = collect(output).await;
    let outcome = handle.join().await;
    assert_eq!(out, vec![0]);
    assert!(outcome.status.is_completed());
}

#[tokio::test]
async fn unordered_fan_out_delivers_every_item() {
    let input = feed_pipe((0u64..100).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(8)
            .with_max_queue_length(16),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());

    let (output, handle) = strategy.execute(input, transform, test_ctx("unordered"));
    let mut out = collect(output).await;
    let outcome = handle.join().await;

    out.sort_unstable();
    let expected: Vec<u64> = (0..100).map(|x| x * 2).collect();
    assert_eq!(out, expected);
    assert_eq!(outcome.metrics.succeeded, 100);
}

#[tokio::test]
async fn drop_oldest_sheds_early_items_under_slow_workers() {
    let input = feed_pipe((0u64..60).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(2)
            .with_max_queue_length(5)
            .with_queue_policy(OverflowPolicy::DropOldest),
    );
    let transform: Arc<dyn Transform<u64, u64>> =
        Arc::new(Doubler::slow(Duration::from_millis(25)));

    let (output, handle) = strategy.execute(input, transform, test_ctx("shedding"));
    let out = collect(output).await;
    let outcome = handle.join().await;

    assert!(out.len() < 60, "expected shedding, got {} items", out.len());
    assert!(outcome.metrics.dropped_oldest > 0);
    // At least one of the earliest inputs was displaced before a worker
    // reached it.
    let earliest_missing = (0u64..10).any(|seq| !out.contains(&(seq * 2)));
    assert!(earliest_missing);
    // Accounting closes: everything enqueued either succeeded or dropped.
    assert_eq!(
        outcome.metrics.enqueued,
        outcome.metrics.succeeded + outcome.metrics.dropped() + outcome.metrics.failed
    );
}

#[tokio::test]
async fn empty_input_completes_without_work() {
    let input = feed_pipe(Vec::<u64>::new()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default().with_max_degree_of_parallelism(4),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());

    let (output, handle) = strategy.execute(input, transform, test_ctx("empty"));
    let out = collect(output).await;
    let outcome = handle.join().await;

    assert!(out.is_empty());
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.metrics.enqueued, 0);
    assert_eq!(outcome.metrics.processed, 0);
}

#[tokio::test]
async fn single_worker_ordered_matches_the_sequential_strategy() {
    let items: Vec<u64> = (0u64..50).collect();

    let parallel = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(1)
            .with_max_queue_length(4)
            .with_queue_policy(OverflowPolicy::Block)
            .with_preserve_ordering(true),
    );
    let (par_out, par_handle) = parallel.execute(
        feed_pipe(items.clone()).await,
        Arc::new(Doubler::instant()) as Arc<dyn Transform<u64, u64>>,
        test_ctx("par"),
    );
    let par = collect(par_out).await;
    par_handle.join().await;

    let sequential = SequentialStrategy::new();
    let (seq_out, seq_handle) = sequential.execute(
        feed_pipe(items).await,
        Arc::new(Doubler::instant()) as Arc<dyn Transform<u64, u64>>,
        test_ctx("seq"),
    );
    let seq = collect(seq_out).await;
    seq_handle.join().await;

    assert_eq!(par, seq);
}

#[tokio::test]
async fn bounded_output_throttles_many_fast_workers() {
    let input = feed_pipe((0u64..100).collect()).await;
    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(50)
            .with_max_queue_length(1000)
            .with_output_buffer_capacity(5)
            .with_preserve_ordering(true),
    );
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());

    let ctx = test_ctx("throttled");
    let (output, handle) = strategy.execute(input, transform, ctx);

    // Slow consumer: 100 items at a few ms each.
    let cancel = CancellationToken::new();
    let mut out = Vec::new();
    while let Some(item) = output.recv(&cancel).await {
        tokio::time::sleep(Duration::from_millis(2)).await;
        out.push(item);
    }
    let outcome = handle.join().await;

    let expected: Vec<u64> = (0..100).map(|x| x * 2).collect();
    assert_eq!(out, expected);
    assert_eq!(outcome.metrics.succeeded, 100);
}

#[tokio::test]
async fn cancellation_terminates_an_infinite_stage_promptly() {
    // Infinite input: the producer keeps feeding until cancellation.
    let cancel = CancellationToken::new();
    let (tx, input) = pipe::<u64>(Some(16));
    let feeder_token = cancel.clone();
    tokio::spawn(async move {
        let mut next = 0u64;
        while tx.send(next, &feeder_token).await.is_ok() {
            next += 1;
        }
    });

    let strategy = ParallelStrategy::new(
        ParallelOptions::default()
            .with_max_degree_of_parallelism(2)
            .with_max_queue_length(8),
    );
    let transform: Arc<dyn Transform<u64, u64>> =
        Arc::new(Doubler::slow(Duration::from_millis(50)));

    let ctx = test_ctx_with_token("endless", cancel.clone());
    let (output, handle) = strategy.execute(input, transform, ctx);

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_millis(500), handle.join())
        .await
        .expect("stage terminated within bounded time");
    assert!(outcome.status.is_cancelled());

    // No duplicate outputs made it through.
    let mut seen = collect(output).await;
    let before = seen.len();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), before);
}

#[tokio::test]
async fn sequential_strategy_preserves_order_inherently() {
    let input = feed_pipe((0u64..20).collect()).await;
    let strategy = SequentialStrategy::new();
    let transform: Arc<dyn Transform<u64, u64>> = Arc::new(Doubler::instant());

    let (output, handle) = strategy.execute(input, transform, test_ctx("seq-order"));
    let out = collect(output).await;
    let outcome = handle.join().await;

    assert_eq!(out, (0..20).map(|x| x * 2).collect::<Vec<_>>());
    assert!(outcome.status.is_completed());
    assert_eq!(outcome.metrics.enqueued, 20);
    assert_eq!(outcome.metrics.succeeded, 20);
}
