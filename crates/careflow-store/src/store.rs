//! EventStore trait definition and query types (C1 + C6)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use careflow_core::event::{AppendEvent, AppendedEvent, EventRecord};
use careflow_core::metadata::WorkflowProvenance;

use crate::error::EventStoreError;

/// A denormalized read-model row.
///
/// All projection tables share this layout; content columns live in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub key: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Aggregated view of one workflow's footprint in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub workflow_type: Option<String>,
    pub event_types: Vec<String>,
    pub first_event_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub event_count: usize,
    pub error_count: usize,
}

/// End-to-end lineage for one aggregate: the trigger that started it all,
/// the workflow it spawned, and every event that workflow touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateLineage {
    pub root: EventRecord,
    pub workflow_id: Option<String>,
    pub events: Vec<EventRecord>,
}

/// The append-only domain-event log.
///
/// Implementations must be thread-safe; appends to distinct streams
/// proceed in parallel, appends within one stream are serialized by the
/// version-uniqueness constraint.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    // =========================================================================
    // Append path (C1)
    // =========================================================================

    /// Append one event.
    ///
    /// Computes `stream_version` inside the same unit of work, runs the
    /// projection router synchronously, and publishes trigger events on the
    /// notify bus after commit. Returns `VersionConflict` when another
    /// writer won the race; callers retry.
    async fn append(&self, event: AppendEvent) -> Result<AppendedEvent, EventStoreError>;

    /// Fetch one event by id.
    async fn get_event(&self, event_id: Uuid) -> Result<EventRecord, EventStoreError>;

    /// All events of a stream in version order.
    async fn load_stream(
        &self,
        stream_id: Uuid,
        stream_type: &str,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    // =========================================================================
    // Trigger bookkeeping (C4/C7 write-backs)
    // =========================================================================

    /// Attach workflow provenance to an event (first writer wins) and
    /// optionally stamp `processed_at`, clearing any prior dispatch error.
    async fn attach_provenance(
        &self,
        event_id: Uuid,
        provenance: &WorkflowProvenance,
        mark_processed: bool,
    ) -> Result<(), EventStoreError>;

    /// Record a failed dispatch attempt; bumps and returns `retry_count`.
    async fn record_dispatch_failure(
        &self,
        event_id: Uuid,
        error: &str,
    ) -> Result<i32, EventStoreError>;

    /// Take an event out of the backlog permanently (manual-triage path):
    /// stamps `processed_at` while keeping the error visible.
    async fn mark_abandoned(&self, event_id: Uuid, error: &str) -> Result<(), EventStoreError>;

    // =========================================================================
    // Query surface (C6)
    // =========================================================================

    /// Events bearing this workflow in their metadata, ordered by
    /// `(created_at, stream_version)`.
    async fn events_for_workflow(
        &self,
        workflow_id: &str,
        workflow_run_id: Option<Uuid>,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Summary of one workflow's footprint, `None` if it left no events.
    async fn workflow_summary(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSummary>, EventStoreError>;

    /// Lineage rooted at the aggregate's trigger event, `None` if the
    /// aggregate never had one.
    async fn lineage_for_aggregate(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<AggregateLineage>, EventStoreError>;

    /// Trigger events not yet dispatched, oldest first (C7's work list).
    async fn unprocessed_triggers(
        &self,
        event_types: &[String],
        older_than: Duration,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    // =========================================================================
    // Projection reads
    // =========================================================================

    /// Read one projection row.
    async fn projection_row(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<ProjectionRow>, EventStoreError>;
}

/// Append with a bounded retry loop around `VersionConflict`.
///
/// Concurrent writers to the same stream race on the version head; the
/// loser simply recomputes and tries again.
pub async fn append_with_retry<S: EventStore + ?Sized>(
    store: &S,
    event: AppendEvent,
    max_attempts: u32,
) -> Result<AppendedEvent, EventStoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.append(event.clone()).await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::debug!(
                    stream_id = %event.stream_id,
                    attempt,
                    "append conflict, retrying"
                );
            }
            other => return other,
        }
    }
}
