//! Pipeline counters, recorded to a [`MetricsStore`] and the `metrics` facade.

use super::store::MetricsStore;

pub const EVENTS_ENQUEUED: &str = "events_enqueued";
pub const EVENTS_DROPPED: &str = "events_dropped";
pub const EVENTS_REJECTED_SHUTDOWN: &str = "events_rejected_shutdown";
pub const ITEMS_STORED: &str = "items_stored";
pub const ITEMS_AGGREGATED: &str = "items_aggregated";
pub const BATCHES_DISPATCHED: &str = "batches_dispatched";
pub const STAGE_FAULTS: &str = "stage_faults";
pub const BUFFER_DEPTH: &str = "buffer_depth";

pub fn record_event_enqueued(store: &MetricsStore) {
    store.increment_counter(EVENTS_ENQUEUED, 1);
    metrics::counter!("transmission_events_enqueued").increment(1);
}

/// Backpressure loss: the buffer stayed full for the whole enqueue timeout.
pub fn record_event_dropped(store: &MetricsStore) {
    store.increment_counter(EVENTS_DROPPED, 1);
    metrics::counter!("transmission_events_dropped").increment(1);
}

/// Event offered after shutdown was requested.
pub fn record_event_rejected(store: &MetricsStore) {
    store.increment_counter(EVENTS_REJECTED_SHUTDOWN, 1);
    metrics::counter!("transmission_events_rejected").increment(1);
}

pub fn record_item_stored(store: &MetricsStore) {
    store.increment_counter(ITEMS_STORED, 1);
    metrics::counter!("transmission_items_stored").increment(1);
}

pub fn record_item_aggregated(store: &MetricsStore) {
    store.increment_counter(ITEMS_AGGREGATED, 1);
    metrics::counter!("transmission_items_aggregated").increment(1);
}

pub fn record_batch_dispatched(store: &MetricsStore, items: usize) {
    store.increment_counter(BATCHES_DISPATCHED, 1);
    metrics::counter!("transmission_batches_dispatched").increment(1);
    metrics::histogram!("transmission_batch_size").record(items as f64);
}

pub fn record_stage_fault(store: &MetricsStore, stage: &'static str) {
    store.increment_counter(STAGE_FAULTS, 1);
    metrics::counter!("transmission_stage_faults", "stage" => stage).increment(1);
}

pub fn record_buffer_depth(store: &MetricsStore, depth: usize) {
    store.set_gauge(BUFFER_DEPTH, depth as f64);
    metrics::gauge!("transmission_buffer_depth").set(depth as f64);
}
