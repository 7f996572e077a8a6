//! The transmission pipeline: memory buffer -> storage -> aggregator -> sender.
//!
//! Three background stages run concurrently from construction on:
//!
//! - **store** drains the memory buffer into storage. After cancellation it
//!   keeps going until the buffer is empty, so accepted events end up on disk.
//! - **aggregate** reads storage into the aggregator and stops reading as
//!   soon as the pipeline is cancelled. Whatever is still stored stays there
//!   for the next start. The aggregator is closed whenever this stage stops.
//! - **send** drains sealed batches into the sender until the aggregator is
//!   closed and empty.
//!
//! A stage that returns an error or panics is logged, counted, and cancels
//! the whole pipeline. Storage is never read on behalf of a dead sender.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregator::{BatchAggregator, TransmissionAggregator};
use crate::buffer::{EnqueueOutcome, MemoryBuffer};
use crate::config::TransmissionConfig;
use crate::error::TransmissionError;
use crate::event::TelemetryEvent;
use crate::lock::NamedLockRegistry;
use crate::sender::{BatchSink, RetryingSender, TransmissionSender};
use crate::shutdown::{ShutdownResult, StageGuard, StageState, StageStatus, StageTracker};
use crate::storage::{FileStorage, TransmissionStorage};
use crate::telemetry::{self, MetricsSnapshot, MetricsStore, SpanExt, StageSpan};

pub const STORE_STAGE: &str = "store";
pub const AGGREGATE_STAGE: &str = "aggregate";
pub const SEND_STAGE: &str = "send";

/// Shared between the pipeline handle and its stage tasks.
struct StageContext {
    pipeline_id: String,
    cancel: CancellationToken,
    stages: Vec<StageStatus>,
    metrics: Arc<MetricsStore>,
    last_fault: Mutex<Option<String>>,
}

impl StageContext {
    fn request_cancel(&self) {
        self.cancel.cancel();
        for stage in &self.stages {
            stage.mark_draining();
        }
    }

    fn report(&self, stage: &'static str, result: &Result<(), TransmissionError>) {
        match result {
            Ok(()) | Err(TransmissionError::Cancelled) => {
                tracing::debug!(stage, "stage stopped");
            }
            Err(e) => {
                tracing::error!(stage, error = %e, "stage faulted, cancelling pipeline");
                telemetry::record_stage_fault(&self.metrics, stage);
                *self.last_fault.lock() = Some(e.to_string());
                self.request_cancel();
            }
        }
    }
}

/// Producer-facing handle owning the three background stages.
///
/// `T` is the transmission unit every [`TelemetryEvent`] is mapped to.
pub struct TransmissionPipeline<T> {
    ctx: Arc<StageContext>,
    buffer: MemoryBuffer<T>,
    tracker: StageTracker,
    dispose_timeout: Duration,
    disposed: AtomicBool,
}

impl<T> TransmissionPipeline<T>
where
    T: TryFrom<TelemetryEvent, Error = TransmissionError> + Send + Sync + 'static,
{
    /// Start all three stages on the current tokio runtime.
    pub fn new(
        buffer: MemoryBuffer<T>,
        storage: Arc<dyn TransmissionStorage<T>>,
        aggregator: Arc<dyn TransmissionAggregator<T>>,
        sender: Arc<dyn TransmissionSender<T>>,
        dispose_timeout: Duration,
    ) -> Result<Self, TransmissionError> {
        let runtime = Handle::try_current().map_err(|_| TransmissionError::NoRuntime)?;

        let tracker = StageTracker::new();
        let (store_status, store_guard) = tracker.register(STORE_STAGE);
        let (aggregate_status, aggregate_guard) = tracker.register(AGGREGATE_STAGE);
        let (send_status, send_guard) = tracker.register(SEND_STAGE);

        let ctx = Arc::new(StageContext {
            pipeline_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            stages: vec![store_status, aggregate_status, send_status],
            metrics: Arc::new(MetricsStore::new()),
            last_fault: Mutex::new(None),
        });
        let cancel = ctx.cancel.clone();

        let store = {
            let metrics = Arc::clone(&ctx.metrics);
            let items = buffer
                .dequeue(cancel.clone())
                .inspect(move |_| telemetry::record_item_stored(&metrics))
                .boxed();
            let storage = Arc::clone(&storage);
            let cancel = cancel.clone();
            async move { storage.enqueue(items, cancel).await }
        };
        spawn_stage(&runtime, &ctx, STORE_STAGE, store_guard, store, || {});

        let aggregate = {
            let metrics = Arc::clone(&ctx.metrics);
            let aggregator = Arc::clone(&aggregator);
            let cancel = cancel.clone();
            let mut items = storage.dequeue(cancel.clone());
            async move {
                while let Some(item) = items.next().await {
                    aggregator.enqueue(item, cancel.clone()).await?;
                    telemetry::record_item_aggregated(&metrics);
                }
                Ok(())
            }
        };
        spawn_stage(&runtime, &ctx, AGGREGATE_STAGE, aggregate_guard, aggregate, {
            let aggregator = Arc::clone(&aggregator);
            move || aggregator.close()
        });

        let send = {
            let metrics = Arc::clone(&ctx.metrics);
            let batches = aggregator
                .dequeue(cancel.clone())
                .inspect(move |batch| telemetry::record_batch_dispatched(&metrics, batch.len()))
                .boxed();
            async move { sender.send(batches, cancel).await }
        };
        spawn_stage(&runtime, &ctx, SEND_STAGE, send_guard, send, {
            let ctx = Arc::clone(&ctx);
            move || ctx.request_cancel()
        });

        tracing::info!(pipeline_id = %ctx.pipeline_id, capacity = buffer.capacity(), "transmission pipeline started");

        Ok(Self {
            ctx,
            buffer,
            tracker,
            dispose_timeout,
            disposed: AtomicBool::new(false),
        })
    }

    /// Map `event` and insert it into the memory buffer.
    ///
    /// Fails only for an invalid event or a mapping failure. After shutdown
    /// was requested the event is discarded silently; a full buffer may block
    /// for up to the enqueue timeout and then discard the event silently.
    pub fn enqueue(&self, event: TelemetryEvent) -> Result<(), TransmissionError> {
        event.validate()?;

        if self.ctx.cancel.is_cancelled() {
            tracing::trace!(event_id = %event.id, "pipeline shutting down, event discarded");
            telemetry::record_event_rejected(&self.ctx.metrics);
            return Ok(());
        }

        let unit = T::try_from(event)?;
        match self.buffer.enqueue(unit) {
            EnqueueOutcome::Accepted => telemetry::record_event_enqueued(&self.ctx.metrics),
            EnqueueOutcome::Dropped => telemetry::record_event_dropped(&self.ctx.metrics),
            EnqueueOutcome::Closed => telemetry::record_event_rejected(&self.ctx.metrics),
        }
        telemetry::record_buffer_depth(&self.ctx.metrics, self.buffer.len());
        Ok(())
    }
}

impl<T> TransmissionPipeline<T>
where
    T: TryFrom<TelemetryEvent, Error = TransmissionError>
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Build a pipeline spooling to `config.storage.directory` and delivering
    /// through `sink` with the configured retry policy.
    pub fn with_file_spool<K>(config: TransmissionConfig, sink: K) -> Result<Self, TransmissionError>
    where
        K: BatchSink<T> + 'static,
    {
        config.validate()?;
        let locks = Arc::new(NamedLockRegistry::new());
        let storage = Arc::new(FileStorage::<T>::new(config.storage, locks)?);
        let aggregator = Arc::new(BatchAggregator::<T>::new(config.aggregator));
        let sender = Arc::new(RetryingSender::new(sink, config.retry));
        Self::new(
            MemoryBuffer::new(config.buffer),
            storage,
            aggregator,
            sender,
            config.dispose_timeout,
        )
    }
}

impl<T> TransmissionPipeline<T> {
    pub fn id(&self) -> &str {
        &self.ctx.pipeline_id
    }

    /// False once shutdown was requested or a stage faulted.
    pub fn is_accepting(&self) -> bool {
        !self.ctx.cancel.is_cancelled()
    }

    pub fn stage_states(&self) -> Vec<(&'static str, StageState)> {
        self.ctx.stages.iter().map(|s| (s.name(), s.state())).collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Message of the most recent stage fault, if any.
    pub fn last_fault(&self) -> Option<String> {
        self.ctx.last_fault.lock().clone()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Cancel all stages and wait, bounded by the dispose timeout, for them
    /// to stop. Later calls return the current state without waiting.
    ///
    /// On a current-thread runtime the stages cannot make progress while
    /// this thread blocks, so only cancellation is signalled; use
    /// [`shutdown`](Self::shutdown) there.
    pub fn close(&self) -> ShutdownResult {
        if !self.begin_dispose() {
            return self.current_result();
        }

        let timeout = self.dispose_timeout;
        let result = match Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => {
                    tracing::warn!("close() on a current-thread runtime does not wait for stages");
                    self.current_result()
                }
                _ => tokio::task::block_in_place(|| self.tracker.wait_blocking(timeout)),
            },
            Err(_) => self.tracker.wait_blocking(timeout),
        };
        self.log_result(&result);
        result
    }

    /// Async form of [`close`](Self::close).
    pub async fn shutdown(&self) -> ShutdownResult {
        if !self.begin_dispose() {
            return self.current_result();
        }
        let result = self.tracker.wait(self.dispose_timeout).await;
        self.log_result(&result);
        result
    }

    /// Returns false if disposal already started.
    fn begin_dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ctx.request_cancel();
        self.buffer.close();
        true
    }

    fn current_result(&self) -> ShutdownResult {
        match self.tracker.running_count() {
            0 => ShutdownResult::Complete,
            remaining => ShutdownResult::Timeout { remaining },
        }
    }

    fn log_result(&self, result: &ShutdownResult) {
        match result {
            ShutdownResult::Complete => {
                tracing::info!(pipeline_id = %self.ctx.pipeline_id, "transmission pipeline stopped");
            }
            ShutdownResult::Timeout { remaining } => {
                tracing::warn!(
                    pipeline_id = %self.ctx.pipeline_id,
                    remaining,
                    "dispose timeout elapsed, stages left running"
                );
            }
        }
    }
}

impl<T> Drop for TransmissionPipeline<T> {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.ctx.request_cancel();
            self.buffer.close();
        }
    }
}

fn spawn_stage<F, E>(
    runtime: &Handle,
    ctx: &Arc<StageContext>,
    name: &'static str,
    guard: StageGuard,
    body: F,
    on_exit: E,
) where
    F: Future<Output = Result<(), TransmissionError>> + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    let span = StageSpan::new(&ctx.pipeline_id, name);
    runtime.spawn(async move {
        let _guard = guard;
        let result = match AssertUnwindSafe(body).catch_unwind().instrument(span.clone()).await {
            Ok(result) => result,
            Err(panic) => Err(TransmissionError::StageFault {
                stage: name,
                reason: panic_message(panic.as_ref()),
            }),
        };
        span.record_result(&result);
        ctx.report(name, &result);
        on_exit();
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
