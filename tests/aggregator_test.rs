//! Tests for batch aggregation.

use std::time::{Duration, Instant};

use event_transmission::{AggregatorConfig, BatchAggregator, TransmissionAggregator, TransmissionError};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

fn aggregator(max_batch_size: usize, linger_ms: u64, max_pending_batches: usize) -> BatchAggregator<u32> {
    BatchAggregator::new(AggregatorConfig {
        max_batch_size,
        max_linger: Duration::from_millis(linger_ms),
        max_pending_batches,
    })
}

#[tokio::test]
async fn test_batches_close_at_max_size() {
    let agg = aggregator(3, 10_000, 16);
    let cancel = CancellationToken::new();
    for i in 0..7 {
        agg.enqueue(i, cancel.clone()).await.unwrap();
    }
    assert_eq!(agg.pending_batches(), 2);
    assert_eq!(agg.open_items(), 1);
    agg.close();

    let batches: Vec<Vec<u32>> = tokio::time::timeout(
        Duration::from_secs(1),
        agg.dequeue(cancel).map(|b| b.into_items()).collect(),
    )
    .await
    .unwrap();
    assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
}

#[tokio::test]
async fn test_open_batch_closes_after_linger() {
    let agg = aggregator(100, 50, 16);
    let cancel = CancellationToken::new();
    let start = Instant::now();
    agg.enqueue(1, cancel.clone()).await.unwrap();
    agg.enqueue(2, cancel.clone()).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(1), agg.dequeue(cancel).next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.items, vec![1, 2]);
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn test_cancellation_seals_open_batch_immediately() {
    let agg = aggregator(100, 10_000, 16);
    let cancel = CancellationToken::new();
    agg.enqueue(5, cancel.clone()).await.unwrap();

    let mut stream = agg.dequeue(cancel.clone());
    cancel.cancel();
    let batch = tokio::time::timeout(Duration::from_millis(500), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.items, vec![5]);
}

#[tokio::test]
async fn test_closed_aggregator_rejects_items() {
    let agg = aggregator(10, 1_000, 16);
    agg.close();

    let err = agg.enqueue(1, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TransmissionError::Validation(_)));

    let batches: Vec<_> = agg.dequeue(CancellationToken::new()).collect().await;
    assert!(batches.is_empty());
}

#[tokio::test]
async fn test_enqueue_waits_while_sealed_batches_are_pending() {
    let agg = aggregator(1, 10_000, 1);
    let cancel = CancellationToken::new();
    agg.enqueue(1, cancel.clone()).await.unwrap();
    assert_eq!(agg.pending_batches(), 1);

    let blocked = {
        let agg = agg.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agg.enqueue(2, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!blocked.is_finished());

    let mut stream = agg.dequeue(cancel);
    assert_eq!(stream.next().await.unwrap().items, vec![1]);

    tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap().unwrap();
    assert_eq!(stream.next().await.unwrap().items, vec![2]);
}
