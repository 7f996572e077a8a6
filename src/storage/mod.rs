//! Durable overflow storage between the memory buffer and the aggregator.
//!
//! The pipeline only depends on [`TransmissionStorage`]; [`FileStorage`] is
//! the directory spool shipped with the crate.

mod file;

use std::path::PathBuf;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::TransmissionError;

pub use file::{FileStorage, SPOOL_EXTENSION};

/// Configuration for the spool directory.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub directory: PathBuf,
    /// How long an idle reader waits before rescanning the directory.
    pub poll_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./transmission-spool"),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Durable store for items that have left the memory buffer.
#[async_trait::async_trait]
pub trait TransmissionStorage<T>: Send + Sync {
    /// Persist every item yielded by `items` until the stream ends.
    ///
    /// Cancellation is observed by the input stream; items it still yields
    /// after `cancel` fires are persisted rather than discarded.
    async fn enqueue(
        &self,
        items: BoxStream<'static, T>,
        cancel: CancellationToken,
    ) -> Result<(), TransmissionError>;

    /// Lazy stream of persisted items, oldest first.
    ///
    /// Every call starts a fresh pass over what is currently stored, so a
    /// consumer can reconnect after a failure and pick up where storage is.
    /// Ends once `cancel` fires; items not yet yielded stay stored.
    fn dequeue(&self, cancel: CancellationToken) -> BoxStream<'static, T>;
}
