//! Self-observability for the transmission pipeline.
//!
//! Provides structured logging setup, stage spans, and counters. Counters are
//! kept in a per-pipeline [`MetricsStore`] and mirrored to the `metrics`
//! facade so an embedding application can export them.

mod logging;
mod metrics;
mod spans;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_batch_dispatched, record_buffer_depth, record_event_dropped, record_event_enqueued,
    record_event_rejected, record_item_aggregated, record_item_stored, record_stage_fault,
    BATCHES_DISPATCHED, BUFFER_DEPTH, EVENTS_DROPPED, EVENTS_ENQUEUED, EVENTS_REJECTED_SHUTDOWN,
    ITEMS_AGGREGATED, ITEMS_STORED, STAGE_FAULTS,
};
pub use spans::{SpanExt, StageSpan};
pub use store::{MetricsSnapshot, MetricsStore};
