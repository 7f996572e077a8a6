//! Telemetry event transmission pipeline.
//!
//! Buffers in-process telemetry events, spools them to durable storage,
//! groups stored items into batches, and hands batches to a pluggable sender.
//!
//! ```text
//! enqueue -> MemoryBuffer -> [store] -> TransmissionStorage
//!         -> [aggregate] -> TransmissionAggregator -> [send] -> TransmissionSender
//! ```
//!
//! # Delivery guarantees
//!
//! - Best effort: a full memory buffer drops events after a bounded wait, and
//!   events offered after shutdown began are discarded. Neither is reported
//!   to the producer.
//! - Storage is the durability boundary. An item read back from storage but
//!   not yet delivered is lost on a crash; an item still in storage is
//!   delivered on the next start. Shutdown stops reading storage and only
//!   flushes what was already read, so a backlog stays on disk.
//! - Shutdown is bounded by the dispose timeout and proceeds regardless of
//!   stage completion.

pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod pipeline;
pub mod sender;
pub mod shutdown;
pub mod storage;
pub mod telemetry;

pub use aggregator::{AggregatorConfig, Batch, BatchAggregator, TransmissionAggregator};
pub use buffer::{BufferConfig, EnqueueOutcome, MemoryBuffer};
pub use config::TransmissionConfig;
pub use error::TransmissionError;
pub use event::{EventData, EventLevel, TelemetryEvent};
pub use lock::{LockError, NamedLockGuard, NamedLockRegistry};
pub use pipeline::TransmissionPipeline;
pub use sender::{BatchSink, ChannelSink, RetryConfig, RetryingSender, TransmissionSender};
pub use shutdown::{ShutdownResult, StageState};
pub use storage::{FileStorage, StorageConfig, TransmissionStorage};
