//! The domain-event envelope
//!
//! Events are the system of record: append-only, versioned per stream,
//! never deleted. The only columns that may change after commit are the
//! processing bookkeeping (`processed_at`, `processing_error`,
//! `retry_count`) and the one-time attachment of workflow provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::EventMetadata;

/// A committed event as read back from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Globally unique event identity (UUID v7, time-ordered)
    pub event_id: Uuid,

    /// Aggregate identity the event belongs to
    pub stream_id: Uuid,

    /// Aggregate kind (`organization`, `role`, `junction.<name>`, ...)
    pub stream_type: String,

    /// Monotonic position within `(stream_id, stream_type)`, starting at 1
    pub stream_version: i64,

    /// Dotted event type, e.g. `role.permission.granted`
    pub event_type: String,

    /// Structured payload, validated against the registry schema on append
    pub event_data: serde_json::Value,

    /// Actor, tenant, reason, correlation and workflow provenance
    pub event_metadata: EventMetadata,

    pub created_at: DateTime<Utc>,

    /// Set when the event has been fully processed (projection for plain
    /// events, workflow dispatch for trigger events)
    pub processed_at: Option<DateTime<Utc>>,

    /// Last processing failure, if any
    pub processing_error: Option<String>,

    /// Number of failed dispatch attempts (trigger events only)
    pub retry_count: i32,
}

impl EventRecord {
    /// Whether the event is still awaiting processing.
    pub fn is_unprocessed(&self) -> bool {
        self.processed_at.is_none() && self.processing_error.is_none()
    }

    /// Whether processing has failed at least once without succeeding since.
    pub fn is_failed(&self) -> bool {
        self.processed_at.is_none() && self.processing_error.is_some()
    }
}

/// Request to append one event to a stream.
///
/// The stream version is never supplied by the caller; the store computes
/// it inside the append transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEvent {
    pub stream_id: Uuid,
    pub stream_type: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    #[serde(default)]
    pub event_metadata: EventMetadata,
}

impl AppendEvent {
    pub fn new(
        stream_id: Uuid,
        stream_type: impl Into<String>,
        event_type: impl Into<String>,
        event_data: serde_json::Value,
    ) -> Self {
        Self {
            stream_id,
            stream_type: stream_type.into(),
            event_type: event_type.into(),
            event_data,
            event_metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.event_metadata = metadata;
        self
    }
}

/// What producers get back from a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendedEvent {
    pub event_id: Uuid,
    pub stream_version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_processing_states() {
        let mut event = EventRecord {
            event_id: Uuid::now_v7(),
            stream_id: Uuid::now_v7(),
            stream_type: "organization".to_string(),
            stream_version: 1,
            event_type: "organization.created".to_string(),
            event_data: json!({"name": "Acme"}),
            event_metadata: EventMetadata::default(),
            created_at: Utc::now(),
            processed_at: None,
            processing_error: None,
            retry_count: 0,
        };

        assert!(event.is_unprocessed());
        assert!(!event.is_failed());

        event.processing_error = Some("boom".to_string());
        assert!(event.is_failed());
        assert!(!event.is_unprocessed());

        event.processed_at = Some(Utc::now());
        assert!(!event.is_failed());
        assert!(!event.is_unprocessed());
    }

    #[test]
    fn test_append_event_roundtrip() {
        let append = AppendEvent::new(
            Uuid::now_v7(),
            "invitation",
            "invitation.created",
            json!({"email": "a@example.com"}),
        );

        let json = serde_json::to_string(&append).unwrap();
        let parsed: AppendEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stream_type, "invitation");
        assert_eq!(parsed.event_type, "invitation.created");
    }
}
