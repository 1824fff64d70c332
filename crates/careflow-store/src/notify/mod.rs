//! Notify channel (C3)
//!
//! A named pub-sub bus with at-most-once, fire-and-forget delivery.
//! Subscribers can miss messages while offline, so every consumer
//! reconciles against the log on (re)subscribe; the bus is a latency
//! optimization, never the source of truth.

mod memory;
mod postgres;

pub use memory::InProcessNotifyBus;
pub use postgres::PgNotifyBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use careflow_core::event::EventRecord;
use careflow_core::metadata::EventMetadata;

/// Channel name for a stream type.
pub fn stream_channel(stream_type: &str) -> String {
    format!("stream.{stream_type}")
}

/// Channel name for an event type.
pub fn type_channel(event_type: &str) -> String {
    format!("type.{event_type}")
}

/// Errors from the notify bus.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The subscription's channel was closed
    #[error("notify channel closed")]
    Closed,

    /// The subscriber fell behind and missed messages; reconcile via the
    /// backlog sweep
    #[error("subscriber lagged, {0} messages dropped")]
    Lagged(u64),

    /// Transport failure (connection lost, listen failed)
    #[error("notify connection error: {0}")]
    Connection(String),

    /// Payload could not be encoded or decoded
    #[error("notify serialization error: {0}")]
    Serialization(String),
}

/// The event context a subscriber needs to act without re-fetching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifiedEvent {
    pub event_type: String,
    pub stream_id: Uuid,
    pub stream_type: String,
    pub event_data: serde_json::Value,
    pub event_metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
}

/// What travels on a channel.
///
/// Oversized payloads degrade to an id-only reference (`event: None`); the
/// subscriber re-fetches the record from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub event_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<NotifiedEvent>,
}

impl NotifyPayload {
    /// Full payload carrying the event context.
    pub fn full(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event: Some(NotifiedEvent {
                event_type: record.event_type.clone(),
                stream_id: record.stream_id,
                stream_type: record.stream_type.clone(),
                event_data: record.event_data.clone(),
                event_metadata: record.event_metadata.clone(),
                created_at: record.created_at,
            }),
        }
    }

    /// Id-only reference; the subscriber re-fetches.
    pub fn reference(event_id: Uuid) -> Self {
        Self {
            event_id,
            event: None,
        }
    }
}

/// An open subscription to one channel.
pub struct NotifySubscription {
    pub(crate) inner: SubscriptionInner,
}

pub(crate) enum SubscriptionInner {
    Broadcast(tokio::sync::broadcast::Receiver<NotifyPayload>),
    Postgres(sqlx::postgres::PgListener),
}

impl NotifySubscription {
    /// Wait for the next payload.
    ///
    /// `Lagged` means messages were dropped while the subscriber was slow;
    /// `Closed`/`Connection` mean the subscription must be re-established.
    pub async fn recv(&mut self) -> Result<NotifyPayload, NotifyError> {
        match &mut self.inner {
            SubscriptionInner::Broadcast(rx) => match rx.recv().await {
                Ok(payload) => Ok(payload),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    Err(NotifyError::Lagged(n))
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => Err(NotifyError::Closed),
            },
            SubscriptionInner::Postgres(listener) => {
                let notification = listener
                    .recv()
                    .await
                    .map_err(|e| NotifyError::Connection(e.to_string()))?;
                serde_json::from_str(notification.payload())
                    .map_err(|e| NotifyError::Serialization(e.to_string()))
            }
        }
    }
}

/// The pub-sub contract.
#[async_trait]
pub trait NotifyBus: Send + Sync + 'static {
    /// At-most-once, fire-and-forget publish.
    async fn publish(&self, channel: &str, payload: &NotifyPayload) -> Result<(), NotifyError>;

    /// Open a subscription to a channel.
    async fn subscribe(&self, channel: &str) -> Result<NotifySubscription, NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(stream_channel("organization"), "stream.organization");
        assert_eq!(
            type_channel("organization.bootstrap.initiated"),
            "type.organization.bootstrap.initiated"
        );
    }

    #[test]
    fn test_reference_payload_roundtrip() {
        let payload = NotifyPayload::reference(Uuid::now_v7());
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("\"event\""));

        let parsed: NotifyPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
        assert!(parsed.event.is_none());
    }
}
