//! In-memory implementation of EventStore for testing
//!
//! Same semantics as the PostgreSQL implementation, including the
//! projection-in-the-same-unit-of-work rule and post-append notify
//! publication, minus real transactions (a single lock serializes the
//! append path, which is exactly what the version constraint provides in
//! Postgres).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use careflow_core::event::{AppendEvent, AppendedEvent, EventRecord};
use careflow_core::metadata::WorkflowProvenance;
use careflow_core::registry::EventTypeRegistry;

use crate::error::EventStoreError;
use crate::notify::{stream_channel, type_channel, NotifyBus, NotifyPayload};
use crate::projection::{self, ProjectionEffect};
use crate::store::{
    AggregateLineage, EventStore, ProjectionRow, WorkflowSummary,
};

/// Projection tables: table name -> key -> row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionTables {
    tables: HashMap<String, BTreeMap<String, ProjectionRow>>,
}

impl ProjectionTables {
    pub fn get(&self, table: &str, key: &str) -> Option<&ProjectionRow> {
        self.tables.get(table)?.get(key)
    }

    pub fn table(&self, table: &str) -> Option<&BTreeMap<String, ProjectionRow>> {
        self.tables.get(table)
    }

    /// Apply one effect. `at` is always the event's `created_at`.
    pub fn apply(&mut self, effect: &ProjectionEffect, at: DateTime<Utc>) {
        match effect {
            ProjectionEffect::Upsert { table, key, row } => {
                self.merge(table, key, row, at, false);
            }
            ProjectionEffect::UpsertIfNewer { table, key, row } => {
                self.merge(table, key, row, at, true);
            }
            ProjectionEffect::InsertIgnore { table, key, row } => {
                let entries = self.tables.entry(table.clone()).or_default();
                entries.entry(key.clone()).or_insert_with(|| ProjectionRow {
                    key: key.clone(),
                    data: serde_json::Value::Object(row.clone()),
                    created_at: at,
                    updated_at: at,
                    deleted_at: None,
                });
            }
            ProjectionEffect::Delete { table, key } => {
                if let Some(entries) = self.tables.get_mut(table) {
                    entries.remove(key);
                }
            }
            ProjectionEffect::SoftDelete { table, key } => {
                if let Some(row) = self.tables.get_mut(table).and_then(|t| t.get_mut(key)) {
                    row.deleted_at = Some(at);
                    row.updated_at = at;
                }
            }
            ProjectionEffect::ArrayAdd {
                table,
                key,
                field,
                value,
            } => {
                let entries = self.tables.entry(table.clone()).or_default();
                let row = entries.entry(key.clone()).or_insert_with(|| ProjectionRow {
                    key: key.clone(),
                    data: serde_json::json!({}),
                    created_at: at,
                    updated_at: at,
                    deleted_at: None,
                });
                if let Some(object) = row.data.as_object_mut() {
                    let array = object
                        .entry(field.clone())
                        .or_insert_with(|| serde_json::Value::Array(vec![]));
                    if let Some(items) = array.as_array_mut() {
                        if !items.contains(value) {
                            items.push(value.clone());
                        }
                    }
                }
                row.updated_at = at;
            }
            ProjectionEffect::ArrayRemove {
                table,
                key,
                field,
                value,
            } => {
                if let Some(row) = self.tables.get_mut(table).and_then(|t| t.get_mut(key)) {
                    if let Some(items) = row
                        .data
                        .get_mut(field)
                        .and_then(serde_json::Value::as_array_mut)
                    {
                        items.retain(|item| item != value);
                    }
                    row.updated_at = at;
                }
            }
        }
    }

    fn merge(
        &mut self,
        table: &str,
        key: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
        at: DateTime<Utc>,
        only_if_newer: bool,
    ) {
        let entries = self.tables.entry(table.to_string()).or_default();
        match entries.get_mut(key) {
            Some(row) => {
                if only_if_newer && row.updated_at > at {
                    return;
                }
                if let Some(object) = row.data.as_object_mut() {
                    for (k, v) in patch {
                        object.insert(k.clone(), v.clone());
                    }
                }
                row.updated_at = at;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    ProjectionRow {
                        key: key.to_string(),
                        data: serde_json::Value::Object(patch.clone()),
                        created_at: at,
                        updated_at: at,
                        deleted_at: None,
                    },
                );
            }
        }
    }
}

struct Inner {
    events: Vec<EventRecord>,
    by_id: HashMap<Uuid, usize>,
    heads: HashMap<(Uuid, String), i64>,
    projections: ProjectionTables,
}

/// In-memory event store.
pub struct InMemoryEventStore {
    registry: Arc<EventTypeRegistry>,
    bus: Option<Arc<dyn NotifyBus>>,
    workflow_channel: String,
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new(registry: Arc<EventTypeRegistry>) -> Self {
        Self {
            registry,
            bus: None,
            workflow_channel: "workflow_events".to_string(),
            inner: RwLock::new(Inner {
                events: vec![],
                by_id: HashMap::new(),
                heads: HashMap::new(),
                projections: ProjectionTables::default(),
            }),
        }
    }

    /// Wire a notify bus for post-append publication.
    pub fn with_bus(mut self, bus: Arc<dyn NotifyBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the trigger channel name (default `workflow_events`).
    pub fn with_workflow_channel(mut self, channel: impl Into<String>) -> Self {
        self.workflow_channel = channel.into();
        self
    }

    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }

    /// Snapshot of the live projection tables.
    pub fn projections_snapshot(&self) -> ProjectionTables {
        self.inner.read().projections.clone()
    }

    /// Rebuild all projections from scratch by replaying every event in
    /// `(stream_id, stream_type, stream_version)` order. The result must
    /// match the live tables exactly.
    pub fn rebuild_projections(&self) -> ProjectionTables {
        let inner = self.inner.read();
        let mut ordered: Vec<&EventRecord> = inner.events.iter().collect();
        ordered.sort_by(|a, b| {
            (a.stream_id, &a.stream_type, a.stream_version).cmp(&(
                b.stream_id,
                &b.stream_type,
                b.stream_version,
            ))
        });

        let mut tables = ProjectionTables::default();
        for event in ordered {
            if let Ok(effects) = projection::route(event) {
                for effect in &effects {
                    tables.apply(effect, event.created_at);
                }
            }
        }
        tables
    }

    fn record_at(inner: &Inner, event_id: Uuid) -> Result<usize, EventStoreError> {
        inner
            .by_id
            .get(&event_id)
            .copied()
            .ok_or(EventStoreError::EventNotFound(event_id))
    }

    fn workflow_events_locked(
        inner: &Inner,
        workflow_id: &str,
        workflow_run_id: Option<Uuid>,
    ) -> Vec<EventRecord> {
        let mut events: Vec<EventRecord> = inner
            .events
            .iter()
            .filter(|e| e.event_metadata.workflow_id.as_deref() == Some(workflow_id))
            .filter(|e| {
                workflow_run_id.map_or(true, |run| e.event_metadata.workflow_run_id == Some(run))
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (a.created_at, a.stream_version).cmp(&(b.created_at, b.stream_version))
        });
        events
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: AppendEvent) -> Result<AppendedEvent, EventStoreError> {
        self.registry
            .validate(&event.stream_type, &event.event_type, &event.event_data)?;

        let is_trigger = self.registry.is_trigger(&event.event_type);
        let record = {
            let mut inner = self.inner.write();

            let head = inner
                .heads
                .get(&(event.stream_id, event.stream_type.clone()))
                .copied()
                .unwrap_or(0);
            let stream_version = head + 1;

            let mut record = EventRecord {
                event_id: Uuid::now_v7(),
                stream_id: event.stream_id,
                stream_type: event.stream_type.clone(),
                stream_version,
                event_type: event.event_type.clone(),
                event_data: event.event_data,
                event_metadata: event.event_metadata,
                created_at: Utc::now(),
                processed_at: None,
                processing_error: None,
                retry_count: 0,
            };

            // Synchronous projection, same unit of work as the append. A
            // projector failure records the error and the event still
            // commits: the log is the source of truth.
            match projection::route(&record) {
                Ok(effects) => {
                    for effect in &effects {
                        inner.projections.apply(effect, record.created_at);
                    }
                    if !is_trigger {
                        record.processed_at = Some(record.created_at);
                    }
                }
                Err(err) => {
                    warn!(
                        event_type = %record.event_type,
                        error = %err,
                        "projection failed; committing event with processing_error"
                    );
                    record.processing_error = Some(err.as_processing_error());
                }
            }

            inner.heads.insert(
                (record.stream_id, record.stream_type.clone()),
                stream_version,
            );
            let index = inner.events.len();
            inner.by_id.insert(record.event_id, index);
            inner.events.push(record.clone());
            record
        };

        // Best-effort publish after the "commit".
        if let Some(bus) = &self.bus {
            let payload = NotifyPayload::full(&record);
            let _ = bus
                .publish(&stream_channel(&record.stream_type), &payload)
                .await;
            let _ = bus
                .publish(&type_channel(&record.event_type), &payload)
                .await;
            if is_trigger {
                let _ = bus.publish(&self.workflow_channel, &payload).await;
            }
        }

        debug!(
            event_id = %record.event_id,
            stream_version = record.stream_version,
            event_type = %record.event_type,
            "appended event"
        );

        Ok(AppendedEvent {
            event_id: record.event_id,
            stream_version: record.stream_version,
        })
    }

    async fn get_event(&self, event_id: Uuid) -> Result<EventRecord, EventStoreError> {
        let inner = self.inner.read();
        let index = Self::record_at(&inner, event_id)?;
        Ok(inner.events[index].clone())
    }

    async fn load_stream(
        &self,
        stream_id: Uuid,
        stream_type: &str,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let inner = self.inner.read();
        let mut events: Vec<EventRecord> = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id && e.stream_type == stream_type)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.stream_version);
        Ok(events)
    }

    async fn attach_provenance(
        &self,
        event_id: Uuid,
        provenance: &WorkflowProvenance,
        mark_processed: bool,
    ) -> Result<(), EventStoreError> {
        let mut inner = self.inner.write();
        let index = Self::record_at(&inner, event_id)?;
        let record = &mut inner.events[index];

        record.event_metadata.attach_provenance(provenance);
        if mark_processed {
            record.processed_at = Some(Utc::now());
            record.processing_error = None;
        }
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        event_id: Uuid,
        error: &str,
    ) -> Result<i32, EventStoreError> {
        let mut inner = self.inner.write();
        let index = Self::record_at(&inner, event_id)?;
        let record = &mut inner.events[index];

        record.processing_error = Some(error.to_string());
        record.retry_count += 1;
        Ok(record.retry_count)
    }

    async fn mark_abandoned(&self, event_id: Uuid, error: &str) -> Result<(), EventStoreError> {
        let mut inner = self.inner.write();
        let index = Self::record_at(&inner, event_id)?;
        let record = &mut inner.events[index];

        record.processing_error = Some(error.to_string());
        record.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn events_for_workflow(
        &self,
        workflow_id: &str,
        workflow_run_id: Option<Uuid>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let inner = self.inner.read();
        Ok(Self::workflow_events_locked(
            &inner,
            workflow_id,
            workflow_run_id,
        ))
    }

    async fn workflow_summary(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSummary>, EventStoreError> {
        let inner = self.inner.read();
        let events = Self::workflow_events_locked(&inner, workflow_id, None);

        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(None);
        };

        let mut event_types: Vec<String> =
            events.iter().map(|e| e.event_type.clone()).collect();
        event_types.sort();
        event_types.dedup();

        Ok(Some(WorkflowSummary {
            workflow_id: workflow_id.to_string(),
            workflow_type: first.event_metadata.workflow_type.clone(),
            event_types,
            first_event_at: first.created_at,
            last_event_at: last.created_at,
            event_count: events.len(),
            error_count: events
                .iter()
                .filter(|e| e.processing_error.is_some())
                .count(),
        }))
    }

    async fn lineage_for_aggregate(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<AggregateLineage>, EventStoreError> {
        let inner = self.inner.read();

        let root = inner
            .events
            .iter()
            .filter(|e| e.stream_id == aggregate_id)
            .find(|e| self.registry.is_trigger(&e.event_type))
            .cloned();

        let Some(root) = root else {
            return Ok(None);
        };

        let workflow_id = root.event_metadata.workflow_id.clone();
        let events = workflow_id
            .as_deref()
            .map(|id| Self::workflow_events_locked(&inner, id, None))
            .unwrap_or_default();

        Ok(Some(AggregateLineage {
            root,
            workflow_id,
            events,
        }))
    }

    async fn unprocessed_triggers(
        &self,
        event_types: &[String],
        older_than: Duration,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let inner = self.inner.read();
        let mut events: Vec<EventRecord> = inner
            .events
            .iter()
            .filter(|e| event_types.contains(&e.event_type))
            .filter(|e| e.processed_at.is_none())
            .filter(|e| e.created_at <= cutoff)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn projection_row(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<ProjectionRow>, EventStoreError> {
        Ok(self.inner.read().projections.get(table, key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use careflow_core::metadata::EventMetadata;
    use serde_json::json;

    fn store() -> InMemoryEventStore {
        InMemoryEventStore::new(Arc::new(EventTypeRegistry::standard()))
    }

    fn role_created(stream_id: Uuid) -> AppendEvent {
        AppendEvent::new(stream_id, "role", "role.created", json!({"name": "admin"}))
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_versions() {
        let store = store();
        let stream_id = Uuid::now_v7();

        let first = store.append(role_created(stream_id)).await.unwrap();
        let second = store
            .append(AppendEvent::new(
                stream_id,
                "role",
                "role.updated",
                json!({"name": "administrator"}),
            ))
            .await
            .unwrap();

        assert_eq!(first.stream_version, 1);
        assert_eq!(second.stream_version, 2);

        // A different stream starts back at 1.
        let other = store.append(role_created(Uuid::now_v7())).await.unwrap();
        assert_eq!(other.stream_version, 1);
    }

    #[tokio::test]
    async fn test_append_rejects_unknown_type() {
        let store = store();
        let result = store
            .append(AppendEvent::new(
                Uuid::now_v7(),
                "role",
                "role.exploded",
                json!({}),
            ))
            .await;
        assert!(matches!(result, Err(EventStoreError::UnknownEventType(_))));
    }

    #[tokio::test]
    async fn test_append_projects_immediately() {
        let store = store();
        let stream_id = Uuid::now_v7();
        store.append(role_created(stream_id)).await.unwrap();

        let row = store
            .projection_row("roles", &stream_id.to_string())
            .await
            .unwrap()
            .expect("projection row");
        assert_eq!(row.data.get("name"), Some(&json!("admin")));

        // Non-trigger events are processed by the projector.
        let events = store.load_stream(stream_id, "role").await.unwrap();
        assert!(events[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_trigger_event_stays_unprocessed_for_listener() {
        let store = store();
        let stream_id = Uuid::now_v7();
        store
            .append(AppendEvent::new(
                stream_id,
                "organization",
                "organization.bootstrap.initiated",
                json!({"subdomain": "acme", "org_data": {}, "users": []}),
            ))
            .await
            .unwrap();

        let events = store.load_stream(stream_id, "organization").await.unwrap();
        assert!(events[0].processed_at.is_none());

        // It shows up in the backlog work list.
        let triggers = store
            .unprocessed_triggers(
                &["organization.bootstrap.initiated".to_string()],
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(triggers.len(), 1);

        // But it still projected the provisional organization row.
        let row = store
            .projection_row("organizations", &stream_id.to_string())
            .await
            .unwrap()
            .expect("provisional row");
        assert_eq!(row.data.get("status"), Some(&json!("provisioning")));
    }

    #[tokio::test]
    async fn test_provenance_attach_and_dispatch_bookkeeping() {
        let store = store();
        let stream_id = Uuid::now_v7();
        let appended = store
            .append(AppendEvent::new(
                stream_id,
                "organization",
                "organization.bootstrap.initiated",
                json!({"subdomain": "acme", "org_data": {}, "users": []}),
            ))
            .await
            .unwrap();

        // A failed dispatch bumps retry_count and keeps it in the backlog.
        let retries = store
            .record_dispatch_failure(appended.event_id, "engine unavailable")
            .await
            .unwrap();
        assert_eq!(retries, 1);
        assert_eq!(
            store
                .unprocessed_triggers(
                    &["organization.bootstrap.initiated".to_string()],
                    Duration::ZERO
                )
                .await
                .unwrap()
                .len(),
            1
        );

        // Success attaches provenance, stamps processed_at, clears error.
        let provenance = WorkflowProvenance::new(
            format!("org-bootstrap-{stream_id}"),
            Uuid::now_v7(),
            "org_bootstrap",
        );
        store
            .attach_provenance(appended.event_id, &provenance, true)
            .await
            .unwrap();

        let event = store.get_event(appended.event_id).await.unwrap();
        assert!(event.processed_at.is_some());
        assert!(event.processing_error.is_none());
        assert_eq!(
            event.event_metadata.workflow_id.as_deref(),
            Some(provenance.workflow_id.as_str())
        );
        assert!(store
            .unprocessed_triggers(
                &["organization.bootstrap.initiated".to_string()],
                Duration::ZERO
            )
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_events_for_workflow_and_summary() {
        let store = store();
        let org_id = Uuid::now_v7();
        let run_id = Uuid::now_v7();
        let provenance =
            WorkflowProvenance::new(format!("org-bootstrap-{org_id}"), run_id, "org_bootstrap");

        let mut metadata = EventMetadata::default();
        metadata.attach_provenance(&provenance);

        store
            .append(
                AppendEvent::new(
                    org_id,
                    "organization",
                    "organization.created",
                    json!({"name": "Acme", "subdomain": "acme"}),
                )
                .with_metadata(metadata.clone()),
            )
            .await
            .unwrap();
        store
            .append(
                AppendEvent::new(
                    org_id,
                    "organization",
                    "organization.activated",
                    json!({}),
                )
                .with_metadata(metadata),
            )
            .await
            .unwrap();

        let events = store
            .events_for_workflow(&provenance.workflow_id, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "organization.created");

        let summary = store
            .workflow_summary(&provenance.workflow_id)
            .await
            .unwrap()
            .expect("summary");
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.workflow_type.as_deref(), Some("org_bootstrap"));
        assert_eq!(summary.error_count, 0);

        // Run filter excludes other runs.
        let other_run = store
            .events_for_workflow(&provenance.workflow_id, Some(Uuid::now_v7()))
            .await
            .unwrap();
        assert!(other_run.is_empty());
    }

    #[tokio::test]
    async fn test_replay_matches_live_projections() {
        let store = store();
        let role_id = Uuid::now_v7();

        store.append(role_created(role_id)).await.unwrap();
        store
            .append(AppendEvent::new(
                role_id,
                "role",
                "role.permission.granted",
                json!({"permission": "clients.read"}),
            ))
            .await
            .unwrap();
        store
            .append(AppendEvent::new(
                role_id,
                "role",
                "role.permission.granted",
                json!({"permission": "clients.write"}),
            ))
            .await
            .unwrap();
        store
            .append(AppendEvent::new(
                role_id,
                "role",
                "role.permission.revoked",
                json!({"permission": "clients.read"}),
            ))
            .await
            .unwrap();

        let live = store.projections_snapshot();
        let rebuilt = store.rebuild_projections();
        assert_eq!(live, rebuilt);

        let row = store
            .projection_row("roles", &role_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.data.get("permissions"), Some(&json!(["clients.write"])));
    }

    #[tokio::test]
    async fn test_lineage_for_aggregate() {
        let store = store();
        let org_id = Uuid::now_v7();

        let appended = store
            .append(AppendEvent::new(
                org_id,
                "organization",
                "organization.bootstrap.initiated",
                json!({"subdomain": "acme", "org_data": {}, "users": []}),
            ))
            .await
            .unwrap();

        // Before dispatch: lineage exists but has no workflow yet.
        let lineage = store.lineage_for_aggregate(org_id).await.unwrap().unwrap();
        assert!(lineage.workflow_id.is_none());

        let provenance = WorkflowProvenance::new(
            format!("org-bootstrap-{org_id}"),
            Uuid::now_v7(),
            "org_bootstrap",
        );
        store
            .attach_provenance(appended.event_id, &provenance, true)
            .await
            .unwrap();

        let lineage = store.lineage_for_aggregate(org_id).await.unwrap().unwrap();
        assert_eq!(
            lineage.workflow_id.as_deref(),
            Some(provenance.workflow_id.as_str())
        );
        assert_eq!(lineage.events.len(), 1);

        // No trigger event, no lineage.
        assert!(store
            .lineage_for_aggregate(Uuid::now_v7())
            .await
            .unwrap()
            .is_none());
    }
}
