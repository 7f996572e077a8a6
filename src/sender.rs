//! Delivery of sealed batches to the remote endpoint.
//!
//! The wire protocol lives behind [`BatchSink`]. [`RetryingSender`] owns the
//! retry/backoff policy; the pipeline never sees individual delivery failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Batch;
use crate::error::TransmissionError;

/// Retry policy for batch delivery.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Exponential delay before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Consumes the stream of batches produced by the aggregator.
#[async_trait::async_trait]
pub trait TransmissionSender<T>: Send + Sync {
    /// Deliver batches until the stream ends.
    async fn send(
        &self,
        batches: BoxStream<'static, Batch<T>>,
        cancel: CancellationToken,
    ) -> Result<(), TransmissionError>;
}

/// A single-batch transport.
#[async_trait::async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn send_batch(&self, batch: &Batch<T>) -> Result<(), TransmissionError>;
}

/// Sender that retries each batch with exponential backoff and jitter.
///
/// A batch that exhausts its attempts is logged and dropped. Cancellation
/// interrupts backoff sleeps but never a `send_batch` call in progress.
pub struct RetryingSender<S> {
    sink: S,
    config: RetryConfig,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl<S> RetryingSender<S> {
    pub fn new(sink: S, config: RetryConfig) -> Self {
        Self {
            sink,
            config: RetryConfig { max_attempts: config.max_attempts.max(1), ..config },
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Batches delivered successfully.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Batches given up on.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.config.backoff(attempt);
        let spread = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
    }
}

impl<S> RetryingSender<S> {
    async fn deliver<T>(&self, batch: &Batch<T>, cancel: &CancellationToken)
    where
        S: BatchSink<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.sink.send_batch(batch).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("transmission_batches_delivered").increment(1);
                    tracing::debug!(items = batch.len(), attempt, "batch delivered");
                    return;
                }
                Err(e) => e,
            };

            if attempt >= self.config.max_attempts || !err.is_transient() {
                self.give_up(batch, attempt, &err);
                return;
            }

            let delay = self.jittered(attempt);
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "batch send failed, retrying");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    self.give_up(batch, attempt, &err);
                    return;
                }
            }
        }
    }

    fn give_up<T>(&self, batch: &Batch<T>, attempts: u32, err: &TransmissionError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("transmission_batches_failed").increment(1);
        tracing::error!(items = batch.len(), attempts, error = %err, "batch dropped");
    }
}

#[async_trait::async_trait]
impl<T, S> TransmissionSender<T> for RetryingSender<S>
where
    T: Send + Sync + 'static,
    S: BatchSink<T>,
{
    async fn send(
        &self,
        mut batches: BoxStream<'static, Batch<T>>,
        cancel: CancellationToken,
    ) -> Result<(), TransmissionError> {
        while let Some(batch) = batches.next().await {
            if batch.is_empty() {
                continue;
            }
            self.deliver(&batch, &cancel).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T, S> BatchSink<T> for Arc<S>
where
    T: Sync,
    S: BatchSink<T> + ?Sized,
{
    async fn send_batch(&self, batch: &Batch<T>) -> Result<(), TransmissionError> {
        (**self).send_batch(batch).await
    }
}

/// Hands batches to an in-process receiver.
pub struct ChannelSink<T> {
    tx: mpsc::Sender<Batch<T>>,
}

impl<T> ChannelSink<T> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Batch<T>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> BatchSink<T> for ChannelSink<T> {
    async fn send_batch(&self, batch: &Batch<T>) -> Result<(), TransmissionError> {
        self.tx.send(batch.clone()).await.map_err(|_| TransmissionError::Send {
            attempts: 1,
            reason: "batch receiver dropped".to_string(),
        })
    }
}
