//! Tests for retrying batch delivery.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use event_transmission::{
    Batch, BatchSink, ChannelSink, RetryConfig, RetryingSender, TransmissionError, TransmissionSender,
};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

/// Fails the first `failures` calls with `error`, then succeeds.
struct FlakySink {
    failures: u32,
    transient: bool,
    calls: AtomicU32,
}

impl FlakySink {
    fn new(failures: u32, transient: bool) -> Self {
        Self { failures, transient, calls: AtomicU32::new(0) }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BatchSink<u32> for FlakySink {
    async fn send_batch(&self, _batch: &Batch<u32>) -> Result<(), TransmissionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            if self.transient {
                return Err(TransmissionError::Send { attempts: call, reason: "endpoint busy".into() });
            }
            return Err(TransmissionError::validation("payload rejected"));
        }
        Ok(())
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn batch(items: Vec<u32>) -> Batch<u32> {
    Batch { items, opened_at: Instant::now() }
}

async fn send_one(sender: &RetryingSender<Arc<FlakySink>>, items: Vec<u32>, cancel: CancellationToken) {
    let batches = stream::iter(vec![batch(items)]).boxed();
    sender.send(batches, cancel).await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let sink = Arc::new(FlakySink::new(2, true));
    let sender = RetryingSender::new(sink.clone(), fast_retry(5));

    send_one(&sender, vec![1, 2, 3], CancellationToken::new()).await;

    assert_eq!(sink.calls(), 3);
    assert_eq!(sender.delivered(), 1);
    assert_eq!(sender.failed(), 0);
}

#[tokio::test]
async fn test_batch_is_dropped_after_max_attempts() {
    let sink = Arc::new(FlakySink::new(u32::MAX, true));
    let sender = RetryingSender::new(sink.clone(), fast_retry(3));

    send_one(&sender, vec![1], CancellationToken::new()).await;

    assert_eq!(sink.calls(), 3);
    assert_eq!(sender.delivered(), 0);
    assert_eq!(sender.failed(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let sink = Arc::new(FlakySink::new(1, false));
    let sender = RetryingSender::new(sink.clone(), fast_retry(5));

    send_one(&sender, vec![1], CancellationToken::new()).await;

    assert_eq!(sink.calls(), 1);
    assert_eq!(sender.failed(), 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let sink = Arc::new(FlakySink::new(u32::MAX, true));
    let sender = RetryingSender::new(
        sink.clone(),
        RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
        },
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let start = Instant::now();
    send_one(&sender, vec![1], cancel).await;

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(sink.calls(), 1);
    assert_eq!(sender.failed(), 1);
}

#[tokio::test]
async fn test_empty_batches_are_skipped() {
    let sink = Arc::new(FlakySink::new(0, true));
    let sender = RetryingSender::new(sink.clone(), fast_retry(1));

    let batches = stream::iter(vec![batch(vec![]), batch(vec![4])]).boxed();
    sender.send(batches, CancellationToken::new()).await.unwrap();

    assert_eq!(sink.calls(), 1);
    assert_eq!(sender.delivered(), 1);
}

#[tokio::test]
async fn test_channel_sink_forwards_batches() {
    let (sink, mut rx) = ChannelSink::new(4);
    let sender = RetryingSender::new(sink, fast_retry(1));

    let batches = stream::iter(vec![batch(vec![1, 2]), batch(vec![3])]).boxed();
    sender.send(batches, CancellationToken::new()).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().items, vec![1, 2]);
    assert_eq!(rx.recv().await.unwrap().items, vec![3]);
    assert_eq!(sender.delivered(), 2);
}
