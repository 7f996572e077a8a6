//! Span utilities for pipeline stages.

use tracing::{info_span, Span};

/// Extension trait for adding outcome fields to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for background stage spans.
pub struct StageSpan;

impl StageSpan {
    /// Span covering one stage loop from start to stop.
    ///
    /// `status` and `error.message` are filled in by [`SpanExt::record_result`].
    pub fn new(pipeline_id: &str, stage: &'static str) -> Span {
        info_span!(
            "transmission_stage",
            pipeline_id = %pipeline_id,
            stage,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
