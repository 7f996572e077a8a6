//! Tests for the bounded memory buffer.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use event_transmission::{BufferConfig, EnqueueOutcome, MemoryBuffer};
use futures::StreamExt;
use tokio_test::{assert_pending, assert_ready_eq};
use tokio_util::sync::CancellationToken;

fn buffer(capacity: usize, timeout_ms: u64) -> MemoryBuffer<u32> {
    MemoryBuffer::new(BufferConfig {
        capacity,
        enqueue_timeout: Duration::from_millis(timeout_ms),
    })
}

#[tokio::test]
async fn test_dequeue_preserves_enqueue_order() {
    let buf = buffer(16, 100);
    for i in 0..10 {
        assert_eq!(buf.enqueue(i), EnqueueOutcome::Accepted);
    }
    buf.close();

    let items: Vec<u32> = buf.dequeue(CancellationToken::new()).collect().await;
    assert_eq!(items, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_full_buffer_drops_after_timeout() {
    let buf = buffer(2, 100);
    assert_eq!(buf.enqueue(1), EnqueueOutcome::Accepted);
    assert_eq!(buf.enqueue(2), EnqueueOutcome::Accepted);

    let start = Instant::now();
    assert_eq!(buf.enqueue(3), EnqueueOutcome::Dropped);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(90), "returned too early: {waited:?}");
    assert!(waited < Duration::from_secs(1), "waited too long: {waited:?}");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let items: Vec<u32> = buf.dequeue(cancel).collect().await;
    assert_eq!(items, vec![1, 2]);
}

#[tokio::test]
async fn test_cancellation_drains_buffered_items_then_ends() {
    let buf = buffer(8, 100);
    buf.enqueue(7);
    buf.enqueue(8);
    buf.enqueue(9);

    let cancel = CancellationToken::new();
    let stream = buf.dequeue(cancel.clone());
    cancel.cancel();

    let items = tokio::time::timeout(Duration::from_secs(1), stream.collect::<Vec<_>>())
        .await
        .expect("stream should end after draining");
    assert_eq!(items, vec![7, 8, 9]);
}

#[tokio::test]
async fn test_dequeue_suspends_until_item_arrives() {
    let buf = buffer(8, 100);
    let mut stream = buf.dequeue(CancellationToken::new());

    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(pending.is_err(), "empty buffer must not yield");

    buf.enqueue(42);
    let item = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert_eq!(item, Some(42));
}

#[test]
fn test_consumer_is_woken_by_enqueue() {
    let buf = buffer(4, 100);
    let mut stream = buf.dequeue(CancellationToken::new());
    let mut next = tokio_test::task::spawn(stream.next());

    assert_pending!(next.poll());
    buf.enqueue(5);
    assert!(next.is_woken());
    assert_ready_eq!(next.poll(), Some(5));
}

#[tokio::test]
async fn test_cancelling_idle_stream_ends_it() {
    let buf = buffer(8, 100);
    let cancel = CancellationToken::new();
    let mut stream = buf.dequeue(cancel.clone());

    let waiter = tokio::spawn(async move { stream.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(next, None);
}

#[tokio::test]
async fn test_new_stream_does_not_replay_consumed_items() {
    let buf = buffer(8, 100);
    for i in 0..4 {
        buf.enqueue(i);
    }

    let first: Vec<u32> = buf.dequeue(CancellationToken::new()).take(2).collect().await;
    assert_eq!(first, vec![0, 1]);

    buf.close();
    let rest: Vec<u32> = buf.dequeue(CancellationToken::new()).collect().await;
    assert_eq!(rest, vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_receive_each_item_once() {
    let buf = buffer(8, 5_000);
    let cancel = CancellationToken::new();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let stream = buf.dequeue(cancel.clone());
            tokio::spawn(async move { stream.collect::<Vec<u32>>().await })
        })
        .collect();

    let producers: Vec<_> = (0..2u32)
        .map(|p| {
            let buf = buf.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    assert_eq!(buf.enqueue(p * 1000 + i), EnqueueOutcome::Accepted);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    buf.close();

    let mut seen = HashSet::new();
    let mut total = 0;
    for consumer in consumers {
        let items = tokio::time::timeout(Duration::from_secs(5), consumer).await.unwrap().unwrap();
        total += items.len();
        seen.extend(items);
    }
    assert_eq!(total, 200);
    assert_eq!(seen.len(), 200);
}
