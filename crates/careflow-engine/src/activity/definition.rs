//! Activity trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use careflow_core::error::ErrorKind;

use super::ActivityContext;

/// Error type for activity failures, classified by kind.
///
/// The kind decides whether the engine retries (`Transient`,
/// `RateLimited`, `Timeout`, `Unknown`) or fails the activity immediately
/// (`Validation`, `Authorization`, `NotFound`, `Conflict`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub kind: ErrorKind,

    pub message: String,

    /// Server-supplied hold-off for rate-limited failures
    #[serde(default, with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,

    /// Additional context for debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            details: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: message.into(),
            retry_after: Some(retry_after),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<careflow_store::EventStoreError> for ActivityError {
    fn from(err: careflow_store::EventStoreError) -> Self {
        use careflow_store::EventStoreError as E;
        match &err {
            E::VersionConflict { .. } => Self::new(ErrorKind::Conflict, err.to_string()),
            E::UnknownEventType(_) | E::Validation(_) | E::Serialization(_) => {
                Self::validation(err.to_string())
            }
            E::EventNotFound(_) => Self::not_found(err.to_string()),
            E::Database(_) => Self::transient(err.to_string()),
        }
    }
}

/// An activity is a unit of work that may fail and be retried.
///
/// Activities run on workers, outside workflow code, and are the only
/// place I/O (including event emission) is permitted. They must be
/// idempotent: re-executing with the same inputs leaves the world in the
/// same final state. Use [`ActivityContext::emit_event_once`] when a
/// retried activity must not double-emit.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier, used to look the activity up in the registry
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity.
    ///
    /// Return a retryable-kind [`ActivityError`] for transient failures
    /// and a non-retryable kind for permanent ones.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_constructors() {
        assert!(ActivityError::transient("net down").is_retryable());
        assert!(!ActivityError::validation("bad payload").is_retryable());
        assert!(ActivityError::timeout("too slow").is_retryable());
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let error = ActivityError::rate_limited("429", Duration::from_secs(7));
        assert!(error.is_retryable());
        assert_eq!(error.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_display_includes_kind() {
        let error = ActivityError::validation("bad email");
        assert_eq!(error.to_string(), "[validation] bad email");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let error = ActivityError::rate_limited("slow down", Duration::from_millis(1500))
            .with_details(serde_json::json!({"status": 429}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }
}
