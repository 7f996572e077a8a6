//! Stage lifecycle tracking for bounded pipeline shutdown.
//!
//! Each background stage registers with a [`StageTracker`] and holds a
//! [`StageGuard`] for as long as its loop runs. Shutdown waits, with a
//! deadline, for every guard to be dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Running,
    Draining,
    Stopped,
}

impl StageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Observable state of one registered stage.
#[derive(Debug, Clone)]
pub struct StageStatus {
    name: &'static str,
    state: Arc<AtomicU8>,
}

impl StageStatus {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Running -> Draining. No effect on a stage that already left Running.
    pub fn mark_draining(&self) {
        let _ = self.state.compare_exchange(
            StageState::Running as u8,
            StageState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

struct Inner {
    running: Mutex<u32>,
    stopped: Condvar,
    notify: Notify,
}

/// Counts running stages and wakes shutdown waiters as they stop.
#[derive(Clone)]
pub struct StageTracker {
    inner: Arc<Inner>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: Mutex::new(0),
                stopped: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Register a stage in the Running state.
    pub fn register(&self, name: &'static str) -> (StageStatus, StageGuard) {
        *self.inner.running.lock() += 1;
        let status = StageStatus {
            name,
            state: Arc::new(AtomicU8::new(StageState::Running as u8)),
        };
        let guard = StageGuard {
            status: status.clone(),
            inner: Arc::clone(&self.inner),
        };
        (status, guard)
    }

    /// Stages that have not stopped yet.
    pub fn running_count(&self) -> u32 {
        *self.inner.running.lock()
    }

    /// Block the current thread until every stage stopped or `timeout` elapsed.
    pub fn wait_blocking(&self, timeout: Duration) -> ShutdownResult {
        let deadline = Instant::now() + timeout;
        let mut running = self.inner.running.lock();
        while *running > 0 {
            if self.inner.stopped.wait_until(&mut running, deadline).timed_out() {
                break;
            }
        }
        match *running {
            0 => ShutdownResult::Complete,
            remaining => ShutdownResult::Timeout { remaining },
        }
    }

    /// Wait until every stage stopped or `timeout` elapsed.
    pub async fn wait(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let count = self.running_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }

            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                return ShutdownResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep(remaining_time) => {
                    return match self.running_count() {
                        0 => ShutdownResult::Complete,
                        remaining => ShutdownResult::Timeout { remaining },
                    };
                }
            }
        }
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard marking a stage Stopped when its loop exits, including by panic.
pub struct StageGuard {
    status: StageStatus,
    inner: Arc<Inner>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.status.state.store(StageState::Stopped as u8, Ordering::Release);
        {
            let mut running = self.inner.running.lock();
            *running = running.saturating_sub(1);
        }
        self.inner.stopped.notify_all();
        self.inner.notify.notify_waiters();
    }
}
