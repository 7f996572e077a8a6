//! Bounded in-memory FIFO sitting in front of the spool.
//!
//! Producers never block past `enqueue_timeout`: when the buffer stays full
//! for that long the item is dropped. Consumers read through a cancellable
//! stream that drains what is already buffered once cancellation fires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Configuration for the memory buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    pub enqueue_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            enqueue_timeout: Duration::from_millis(100),
        }
    }
}

/// What happened to an item passed to [`MemoryBuffer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The buffer stayed full for the whole enqueue timeout.
    Dropped,
    /// The buffer was closed.
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when a consumer frees a slot.
    space: Condvar,
    /// Signalled when a producer adds an item.
    items: Notify,
    capacity: usize,
    enqueue_timeout: Duration,
}

/// Fixed-capacity multi-producer, multi-consumer FIFO.
pub struct MemoryBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MemoryBuffer<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> MemoryBuffer<T> {
    /// Create a buffer. A zero capacity is raised to one.
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(4096)),
                    closed: false,
                }),
                space: Condvar::new(),
                items: Notify::new(),
                capacity,
                enqueue_timeout: config.enqueue_timeout,
            }),
        }
    }

    /// Insert an item, waiting up to the enqueue timeout for space.
    ///
    /// Blocks the calling thread while the buffer is full. An item that still
    /// does not fit when the timeout elapses is dropped without an error.
    pub fn enqueue(&self, item: T) -> EnqueueOutcome {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        if !state.closed && state.items.len() >= shared.capacity {
            let deadline = Instant::now() + shared.enqueue_timeout;
            while !state.closed && state.items.len() >= shared.capacity {
                if shared.space.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        if state.closed {
            return EnqueueOutcome::Closed;
        }
        if state.items.len() >= shared.capacity {
            tracing::debug!(capacity = shared.capacity, "memory buffer full, item dropped");
            return EnqueueOutcome::Dropped;
        }

        state.items.push_back(item);
        drop(state);
        shared.items.notify_one();
        EnqueueOutcome::Accepted
    }

    /// Non-blocking pop.
    pub fn try_dequeue(&self) -> Option<T> {
        self.shared.pop()
    }

    /// Stop accepting items and wake every waiter.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.space.notify_all();
        self.shared.items.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T: Send + 'static> MemoryBuffer<T> {
    /// Lazy single-pass stream of buffered items.
    ///
    /// Suspends while the buffer is empty. Ends when the buffer is closed and
    /// empty, or once `cancel` fires and the items already buffered have been
    /// yielded. Several streams may be consumed concurrently; each item is
    /// delivered to exactly one of them.
    pub fn dequeue(&self, cancel: CancellationToken) -> BoxStream<'static, T> {
        let shared = Arc::clone(&self.shared);
        stream::unfold((shared, cancel), |(shared, cancel)| async move {
            let item = shared.next(&cancel).await?;
            Some((item, (shared, cancel)))
        })
        .boxed()
    }
}

impl<T> Shared<T> {
    fn pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    async fn next(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.pop() {
                return Some(item);
            }
            let closed = self.state.lock().closed;
            if closed || cancel.is_cancelled() {
                return None;
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => {}
            }
        }
    }
}
