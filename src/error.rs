//! Error types for the transmission pipeline.
//!
//! Backpressure drops and shutdown-time rejections are not errors and never
//! show up here. Only synchronous argument faults and collaborator failures do.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Send failed after {attempts} attempt(s): {reason}")]
    Send { attempts: u32, reason: String },

    #[error("Stage {stage} faulted: {reason}")]
    StageFault { stage: &'static str, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No tokio runtime available to start pipeline stages")]
    NoRuntime,
}

impl TransmissionError {
    /// Shorthand for a validation fault.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Send { .. })
    }
}
