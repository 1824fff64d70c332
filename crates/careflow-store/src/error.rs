//! Event-store error type

use uuid::Uuid;

use careflow_core::registry::RegistryError;

/// Errors from event-store operations.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Another writer appended to the stream first; the caller retries
    #[error("version conflict on stream {stream_id} ({stream_type})")]
    VersionConflict { stream_id: Uuid, stream_type: String },

    /// Event type not present in the registry
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Payload or stream-type rejected by the registry
    #[error("validation failed: {0}")]
    Validation(String),

    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RegistryError> for EventStoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownEventType(t) => Self::UnknownEventType(t),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl EventStoreError {
    /// Whether the caller should retry the append.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use careflow_core::schema::SchemaViolation;

    #[test]
    fn test_registry_error_mapping() {
        let unknown = RegistryError::UnknownEventType("x.y".to_string());
        assert!(matches!(
            EventStoreError::from(unknown),
            EventStoreError::UnknownEventType(_)
        ));

        let invalid = RegistryError::InvalidPayload {
            event_type: "x.y".to_string(),
            violation: SchemaViolation::NotAnObject,
        };
        assert!(matches!(
            EventStoreError::from(invalid),
            EventStoreError::Validation(_)
        ));
    }

    #[test]
    fn test_retryable() {
        let conflict = EventStoreError::VersionConflict {
            stream_id: Uuid::now_v7(),
            stream_type: "role".to_string(),
        };
        assert!(conflict.is_retryable());
        assert!(!EventStoreError::UnknownEventType("x".to_string()).is_retryable());
    }
}
