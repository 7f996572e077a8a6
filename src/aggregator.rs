//! Groups persisted items into size- and time-bounded batches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::TransmissionError;

/// Configuration for batch aggregation.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_batch_size: usize,
    /// Maximum time the first item of an open batch waits for company.
    pub max_linger: Duration,
    /// Sealed batches allowed to wait for the sender before enqueue blocks.
    pub max_pending_batches: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_linger: Duration::from_secs(1),
            max_pending_batches: 16,
        }
    }
}

/// An ordered group of items delivered together.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub opened_at: Instant,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Folds single items into batches.
#[async_trait::async_trait]
pub trait TransmissionAggregator<T>: Send + Sync {
    /// Add one item to the batch in progress.
    async fn enqueue(&self, item: T, cancel: CancellationToken) -> Result<(), TransmissionError>;

    /// Lazy stream of sealed batches. Ends once the aggregator is closed and
    /// every batch has been handed out.
    fn dequeue(&self, cancel: CancellationToken) -> BoxStream<'static, Batch<T>>;

    /// Mark the input finished. The open batch is sealed by the next reader.
    fn close(&self);
}

struct State<T> {
    open: Vec<T>,
    opened_at: Option<Instant>,
    sealed: VecDeque<Batch<T>>,
    closed: bool,
}

impl<T> State<T> {
    fn seal(&mut self, max_batch_size: usize) {
        let Some(opened_at) = self.opened_at.take() else { return };
        let items = std::mem::replace(&mut self.open, Vec::with_capacity(max_batch_size));
        self.sealed.push_back(Batch { items, opened_at });
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    batches: Notify,
    space: Notify,
    config: AggregatorConfig,
}

/// Batch aggregator closing a batch at `max_batch_size` items or after
/// `max_linger`, whichever comes first.
pub struct BatchAggregator<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BatchAggregator<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Send + 'static> BatchAggregator<T> {
    pub fn new(config: AggregatorConfig) -> Self {
        let config = AggregatorConfig {
            max_batch_size: config.max_batch_size.max(1),
            max_pending_batches: config.max_pending_batches.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    open: Vec::with_capacity(config.max_batch_size),
                    opened_at: None,
                    sealed: VecDeque::new(),
                    closed: false,
                }),
                batches: Notify::new(),
                space: Notify::new(),
                config,
            }),
        }
    }

    /// Sealed batches not yet handed out.
    pub fn pending_batches(&self) -> usize {
        self.shared.state.lock().sealed.len()
    }

    /// Items in the batch currently open.
    pub fn open_items(&self) -> usize {
        self.shared.state.lock().open.len()
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> TransmissionAggregator<T> for BatchAggregator<T> {
    async fn enqueue(&self, item: T, cancel: CancellationToken) -> Result<(), TransmissionError> {
        let shared = &*self.shared;
        let max_batch_size = shared.config.max_batch_size;
        let mut item = Some(item);

        loop {
            let space = shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = shared.state.lock();
                if state.closed {
                    return Err(TransmissionError::validation("aggregator is closed"));
                }
                // Past cancellation the item is accepted regardless so the drain can finish.
                if state.sealed.len() < shared.config.max_pending_batches || cancel.is_cancelled() {
                    if let Some(item) = item.take() {
                        if state.open.is_empty() {
                            state.opened_at = Some(Instant::now());
                        }
                        state.open.push(item);
                        if state.open.len() >= max_batch_size {
                            state.seal(max_batch_size);
                        }
                    }
                    drop(state);
                    shared.batches.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                () = &mut space => {}
                () = cancel.cancelled() => {}
            }
        }
    }

    fn dequeue(&self, cancel: CancellationToken) -> BoxStream<'static, Batch<T>> {
        let shared = Arc::clone(&self.shared);
        stream::unfold((shared, cancel), |(shared, cancel)| async move {
            let batch = shared.next(&cancel).await?;
            Some((batch, (shared, cancel)))
        })
        .boxed()
    }

    fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.batches.notify_waiters();
        self.shared.batches.notify_one();
        self.shared.space.notify_waiters();
    }
}

impl<T> Shared<T> {
    async fn next(&self, cancel: &CancellationToken) -> Option<Batch<T>> {
        let linger = self.config.max_linger;
        loop {
            let notified = self.batches.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if let Some(batch) = state.sealed.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Some(batch);
                }
                let expired = state.opened_at.is_some_and(|t| t.elapsed() >= linger);
                if !state.open.is_empty() && (expired || state.closed || cancel.is_cancelled()) {
                    state.seal(self.config.max_batch_size);
                    continue;
                }
                if state.closed {
                    return None;
                }
                state.opened_at.map(|t| t + linger)
            };

            let sleep_at = wake_at.unwrap_or_else(|| Instant::now() + linger);
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(sleep_at.into()), if wake_at.is_some() => {}
                () = cancel.cancelled(), if !cancel.is_cancelled() => {}
            }
        }
    }
}
