//! Directory spool: one JSON file per item.
//!
//! File names start with a zero-padded microsecond timestamp followed by a
//! per-process sequence number, so lexical order is enqueue order. A writer
//! fills `<name>.tse.tmp` and renames it to `<name>.tse` while holding the
//! file's named lock, so a reader only ever lists complete files. Readers
//! take the lock before reading and delete the file once it is read.
//!
//! A reader stops at cancellation. Files it has not taken stay on disk for
//! the next reader.

use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{StorageConfig, TransmissionStorage};
use crate::error::TransmissionError;
use crate::lock::NamedLockRegistry;

/// Extension of committed spool files.
pub const SPOOL_EXTENSION: &str = "tse";

/// Suffix of files still being written.
const PARTIAL_SUFFIX: &str = "tmp";

struct Spool {
    directory: PathBuf,
    poll_interval: Duration,
    locks: Arc<NamedLockRegistry>,
    sequence: AtomicU64,
}

/// File-per-item spool guarded by a [`NamedLockRegistry`].
pub struct FileStorage<T> {
    spool: Arc<Spool>,
    _item: PhantomData<fn() -> T>,
}

impl<T> FileStorage<T> {
    /// Open (creating if needed) the spool directory.
    pub fn new(config: StorageConfig, locks: Arc<NamedLockRegistry>) -> Result<Self, TransmissionError> {
        std::fs::create_dir_all(&config.directory)?;
        tracing::debug!(directory = %config.directory.display(), "spool opened");
        Ok(Self {
            spool: Arc::new(Spool {
                directory: config.directory,
                poll_interval: config.poll_interval,
                locks,
                sequence: AtomicU64::new(0),
            }),
            _item: PhantomData,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.spool.directory
    }

    /// Number of committed files currently in the spool.
    pub fn pending_count(&self) -> Result<usize, TransmissionError> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.spool.directory)? {
            if is_spool_file(&entry?.path()) {
                count += 1;
            }
        }
        Ok(count)
    }
}

impl<T> Clone for FileStorage<T> {
    fn clone(&self) -> Self {
        Self { spool: Arc::clone(&self.spool), _item: PhantomData }
    }
}

#[async_trait::async_trait]
impl<T> TransmissionStorage<T> for FileStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(
        &self,
        mut items: BoxStream<'static, T>,
        cancel: CancellationToken,
    ) -> Result<(), TransmissionError> {
        let mut stored = 0u64;
        while let Some(item) = items.next().await {
            match self.spool.write(&item, &cancel).await {
                Ok(()) => stored += 1,
                Err(TransmissionError::Serialization(e)) => {
                    tracing::warn!(error = %e, "item could not be encoded, skipped");
                }
                Err(TransmissionError::Cancelled) => {
                    tracing::debug!("spool write lock wait cancelled, item skipped");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(stored, "spool input exhausted");
        Ok(())
    }

    fn dequeue(&self, cancel: CancellationToken) -> BoxStream<'static, T> {
        let reader = SpoolReader {
            spool: Arc::clone(&self.spool),
            pending: VecDeque::new(),
            skipped: HashSet::new(),
            cancel,
        };
        stream::unfold(reader, |mut reader| async move {
            let item = reader.next::<T>().await?;
            Some((item, reader))
        })
        .boxed()
    }
}

impl Spool {
    fn next_file_name(&self) -> String {
        let micros = chrono::Utc::now().timestamp_micros().max(0);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{micros:020}-{seq:010}-{}.{SPOOL_EXTENSION}", Uuid::new_v4().simple())
    }

    async fn write<T: Serialize>(
        &self,
        item: &T,
        cancel: &CancellationToken,
    ) -> Result<(), TransmissionError> {
        let body = serde_json::to_vec(item)?;
        let name = self.next_file_name();

        let _guard = self.locks.acquire_write(&name, cancel).await?;
        let path = self.directory.join(&name);
        let partial = self.directory.join(format!("{name}.{PARTIAL_SUFFIX}"));
        tokio::fs::write(&partial, body).await?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read and delete one spool file. `None` if another reader got it first.
    async fn take(&self, path: &Path, cancel: &CancellationToken) -> Result<Option<Vec<u8>>, TransmissionError> {
        let key = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransmissionError::validation(format!("unreadable spool path {}", path.display())))?;

        let _guard = self.locks.acquire_read(key, cancel).await?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_spool_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn is_spool_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SPOOL_EXTENSION)
}

struct SpoolReader {
    spool: Arc<Spool>,
    pending: VecDeque<PathBuf>,
    /// Files this reader gives up on: read but not deletable, or lock wait
    /// cancelled. Skipped for the rest of this pass; a fresh reader retries them.
    skipped: HashSet<PathBuf>,
    cancel: CancellationToken,
}

impl SpoolReader {
    async fn next<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            while let Some(path) = self.pending.pop_front() {
                if self.cancel.is_cancelled() {
                    return None;
                }
                match self.spool.take(&path, &self.cancel).await {
                    Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                        Ok(item) => return Some(item),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "undecodable spool file discarded");
                        }
                    },
                    Ok(None) => {}
                    Err(TransmissionError::Cancelled) => {
                        tracing::debug!(path = %path.display(), "spool read lock wait cancelled, left for recovery");
                        self.skipped.insert(path);
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "spool file skipped");
                        self.skipped.insert(path);
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return None;
            }
            match self.spool.scan().await {
                Ok(paths) => {
                    self.pending = paths
                        .into_iter()
                        .filter(|p| !self.skipped.contains(p))
                        .collect();
                }
                Err(e) => tracing::warn!(error = %e, "spool scan failed"),
            }
            if !self.pending.is_empty() {
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.spool.poll_interval) => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }
}
