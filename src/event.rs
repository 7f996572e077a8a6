//! Telemetry events and their transmission-ready representation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransmissionError;

/// Event severity, most severe first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventLevel {
    Critical,
    Error,
    Warning,
    #[default]
    Informational,
    Verbose,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Informational => "informational",
            Self::Verbose => "verbose",
        }
    }
}

/// One unit of observability data produced by the capture layer.
///
/// Events are moved into the pipeline on enqueue and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: Uuid,
    pub name: String,
    pub provider_name: String,
    pub level: EventLevel,
    pub message: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub activity_id: Uuid,
    pub related_activity_id: Option<Uuid>,
    pub session_name: String,
    pub user_id: Option<String>,
    pub attachment_id: Option<String>,
    pub process_id: u32,
    pub thread_id: u64,
}

impl TelemetryEvent {
    /// Create an informational event stamped with a fresh id and the current time.
    pub fn new(
        provider_name: impl Into<String>,
        name: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider_name: provider_name.into(),
            level: EventLevel::default(),
            message: None,
            payload: None,
            timestamp: Utc::now(),
            activity_id: Uuid::nil(),
            related_activity_id: None,
            session_name: session_name.into(),
            user_id: None,
            attachment_id: None,
            process_id: std::process::id(),
            thread_id: 0,
        }
    }

    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_activity(mut self, activity_id: Uuid, related: Option<Uuid>) -> Self {
        self.activity_id = activity_id;
        self.related_activity_id = related;
        self
    }

    /// Check required identifiers before the event enters the pipeline.
    pub fn validate(&self) -> Result<(), TransmissionError> {
        if self.id.is_nil() {
            return Err(TransmissionError::validation("event id must not be nil"));
        }
        if self.provider_name.trim().is_empty() {
            return Err(TransmissionError::validation("provider_name must not be empty"));
        }
        if self.session_name.trim().is_empty() {
            return Err(TransmissionError::validation("session_name must not be empty"));
        }
        Ok(())
    }
}

/// Storage- and sender-ready form of a [`TelemetryEvent`].
///
/// The body is the JSON-encoded event; properties duplicate the fields a
/// transport typically routes or partitions on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Base64 when serialized.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

impl EventData {
    /// Decode the body back into the original event.
    pub fn event(&self) -> Result<TelemetryEvent, TransmissionError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.properties.get("event_id").map(String::as_str)
    }
}

impl TryFrom<TelemetryEvent> for EventData {
    type Error = TransmissionError;

    fn try_from(event: TelemetryEvent) -> Result<Self, Self::Error> {
        let body = serde_json::to_vec(&event)?;
        let mut properties = BTreeMap::new();
        properties.insert("event_id".to_string(), event.id.to_string());
        properties.insert("provider".to_string(), event.provider_name);
        properties.insert("level".to_string(), event.level.as_str().to_string());
        properties.insert("session".to_string(), event.session_name);
        Ok(Self { body, properties })
    }
}
