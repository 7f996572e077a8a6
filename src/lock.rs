//! Named per-resource exclusive locks guarding spool files.
//!
//! The registry is an explicit object injected into whoever needs it; there
//! is no process-wide instance. An entry exists only while its key is held
//! or contended and is retired by the last holder.
//!
//! # Reader semantics
//!
//! [`NamedLockRegistry::acquire_read`] does not share the entry with other
//! readers. If an entry is present it is removed from the registry and the
//! reader competes for it once; afterwards the entry is gone. If no entry is
//! present the reader gets a no-op guard immediately. A writer that registers
//! a key after the reader's removal creates a fresh entry the reader does not
//! coordinate with.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::TransmissionError;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock key must not be empty")]
    EmptyKey,
    #[error("Lock acquisition cancelled for key {0}")]
    Cancelled(String),
}

impl From<LockError> for TransmissionError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::EmptyKey => TransmissionError::validation(err.to_string()),
            LockError::Cancelled(_) => TransmissionError::Cancelled,
        }
    }
}

/// Registry of named exclusive locks.
#[derive(Debug, Default)]
pub struct NamedLockRegistry {
    entries: Arc<LockMap>,
}

impl NamedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive ownership of `key`, creating the entry if needed.
    ///
    /// Writers on the same key are granted ownership in arrival order. An
    /// uncontended lock is granted even if `cancel` has already fired; only a
    /// pending wait is interrupted by cancellation.
    pub async fn acquire_write(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<NamedLockGuard, LockError> {
        validate_key(key)?;

        let lock = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match lock_or_cancel(lock.clone(), cancel).await {
            Some(held) => {
                tracing::trace!(key, "write lock acquired");
                Ok(NamedLockGuard {
                    held: Some(held),
                    registry: Some((self.entries.clone(), key.to_string())),
                })
            }
            None => {
                retire_if_idle(&self.entries, key, &lock, 2);
                Err(LockError::Cancelled(key.to_string()))
            }
        }
    }

    /// Take the entry for `key` out of the registry and wait on it once.
    ///
    /// Returns a no-op guard without waiting when no entry exists.
    pub async fn acquire_read(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<NamedLockGuard, LockError> {
        validate_key(key)?;

        let Some((_, lock)) = self.entries.remove(key) else {
            return Ok(NamedLockGuard::noop());
        };

        match lock_or_cancel(lock, cancel).await {
            Some(held) => {
                tracing::trace!(key, "read lock acquired, entry retired");
                Ok(NamedLockGuard { held: Some(held), registry: None })
            }
            None => Err(LockError::Cancelled(key.to_string())),
        }
    }

    /// Whether an entry for `key` is currently registered.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_key(key: &str) -> Result<(), LockError> {
    if key.is_empty() {
        return Err(LockError::EmptyKey);
    }
    Ok(())
}

async fn lock_or_cancel(
    lock: Arc<Mutex<()>>,
    cancel: &CancellationToken,
) -> Option<OwnedMutexGuard<()>> {
    tokio::select! {
        biased;
        held = lock.lock_owned() => Some(held),
        () = cancel.cancelled() => None,
    }
}

/// Remove `key` if it still maps to `lock` and nobody but the map and the
/// caller's `expected - 1` references point at it.
fn retire_if_idle(entries: &LockMap, key: &str, lock: &Arc<Mutex<()>>, expected: usize) {
    entries.remove_if(key, |_, current| {
        Arc::ptr_eq(current, lock) && Arc::strong_count(current) == expected
    });
}

/// Scoped lock handle. Ownership is released when the guard is dropped,
/// including when the holding future is cancelled.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedLockGuard {
    held: Option<OwnedMutexGuard<()>>,
    registry: Option<(Arc<LockMap>, String)>,
}

impl NamedLockGuard {
    fn noop() -> Self {
        Self { held: None, registry: None }
    }

    /// True when nothing was locked (reader found no entry).
    pub fn is_noop(&self) -> bool {
        self.held.is_none()
    }
}

impl std::fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("held", &self.held.is_some())
            .field("key", &self.registry.as_ref().map(|(_, k)| k))
            .finish()
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else { return };
        let lock = OwnedMutexGuard::mutex(&held).clone();
        drop(held);

        // Map entry plus our clone: no waiter and no holder remain.
        if let Some((entries, key)) = self.registry.take() {
            retire_if_idle(&entries, &key, &lock, 2);
        }
    }
}
