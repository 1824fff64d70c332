//! PostgreSQL implementation of EventStore
//!
//! The append path runs in one transaction: lock the stream head, insert
//! the event at head+1, apply the projection effects under a savepoint,
//! stamp the processing bookkeeping, commit. The unique index on
//! `(stream_id, stream_type, stream_version)` is the backstop for two
//! first-appends racing past the head lock; the loser surfaces as
//! `VersionConflict`.
//!
//! Notify publication happens after commit and is best-effort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use careflow_core::event::{AppendEvent, AppendedEvent, EventRecord};
use careflow_core::metadata::WorkflowProvenance;
use careflow_core::registry::EventTypeRegistry;

use crate::error::EventStoreError;
use crate::notify::{stream_channel, type_channel, NotifyBus, NotifyPayload};
use crate::projection::{self, ProjectionEffect};
use crate::store::{AggregateLineage, EventStore, ProjectionRow, WorkflowSummary};

const EVENT_COLUMNS: &str = "event_id, stream_id, stream_type, stream_version, event_type, \
     event_data, event_metadata, created_at, processed_at, processing_error, retry_count";

/// PostgreSQL event store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    registry: Arc<EventTypeRegistry>,
    bus: Option<Arc<dyn NotifyBus>>,
    workflow_channel: String,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, registry: Arc<EventTypeRegistry>) -> Self {
        Self {
            pool,
            registry,
            bus: None,
            workflow_channel: "workflow_events".to_string(),
        }
    }

    /// Wire a notify bus for post-commit publication.
    pub fn with_bus(mut self, bus: Arc<dyn NotifyBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the trigger channel name (default `workflow_events`).
    pub fn with_workflow_channel(mut self, channel: impl Into<String>) -> Self {
        self.workflow_channel = channel.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_effects(
        tx: &mut Transaction<'_, Postgres>,
        effects: &[ProjectionEffect],
        at: DateTime<Utc>,
    ) -> Result<(), EventStoreError> {
        for effect in effects {
            apply_effect(tx, effect, at).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, event), fields(stream_id = %event.stream_id, event_type = %event.event_type))]
    async fn append(&self, event: AppendEvent) -> Result<AppendedEvent, EventStoreError> {
        self.registry
            .validate(&event.stream_type, &event.event_type, &event.event_data)?;
        let is_trigger = self.registry.is_trigger(&event.event_type);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

        // Lock the stream head; concurrent appenders serialize here.
        // Streams with no events yet have nothing to lock and fall through
        // to the uniqueness backstop.
        let head: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT stream_version
            FROM domain_events
            WHERE stream_id = $1 AND stream_type = $2
            ORDER BY stream_version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(event.stream_id)
        .bind(&event.stream_type)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        let record = EventRecord {
            event_id: Uuid::now_v7(),
            stream_id: event.stream_id,
            stream_type: event.stream_type.clone(),
            stream_version: head.unwrap_or(0) + 1,
            event_type: event.event_type.clone(),
            event_data: event.event_data,
            event_metadata: event.event_metadata,
            created_at: Utc::now(),
            processed_at: None,
            processing_error: None,
            retry_count: 0,
        };

        let metadata_json = serde_json::to_value(&record.event_metadata)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        let insert = sqlx::query(
            r#"
            INSERT INTO domain_events
                (event_id, stream_id, stream_type, stream_version, event_type,
                 event_data, event_metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.event_id)
        .bind(record.stream_id)
        .bind(&record.stream_type)
        .bind(record.stream_version)
        .bind(&record.event_type)
        .bind(&record.event_data)
        .bind(&metadata_json)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            let conflict = e
                .as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false);
            if conflict {
                return Err(EventStoreError::VersionConflict {
                    stream_id: record.stream_id,
                    stream_type: record.stream_type,
                });
            }
            return Err(EventStoreError::Database(e.to_string()));
        }

        // Synchronous projection under a savepoint: a projector failure is
        // recorded on the event, never rolled into the append itself.
        match projection::route(&record) {
            Ok(effects) => {
                sqlx::query("SAVEPOINT projection")
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| EventStoreError::Database(e.to_string()))?;

                match Self::apply_effects(&mut tx, &effects, record.created_at).await {
                    Ok(()) => {
                        if !is_trigger {
                            sqlx::query(
                                "UPDATE domain_events SET processed_at = created_at WHERE event_id = $1",
                            )
                            .bind(record.event_id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| EventStoreError::Database(e.to_string()))?;
                        }
                    }
                    Err(apply_err) => {
                        warn!(
                            event_type = %record.event_type,
                            error = %apply_err,
                            "projection apply failed; committing event with processing_error"
                        );
                        sqlx::query("ROLLBACK TO SAVEPOINT projection")
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| EventStoreError::Database(e.to_string()))?;
                        sqlx::query(
                            "UPDATE domain_events SET processing_error = $2 WHERE event_id = $1",
                        )
                        .bind(record.event_id)
                        .bind(apply_err.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| EventStoreError::Database(e.to_string()))?;
                    }
                }
            }
            Err(route_err) => {
                warn!(
                    event_type = %record.event_type,
                    error = %route_err,
                    "no projection applied; committing event with processing_error"
                );
                sqlx::query("UPDATE domain_events SET processing_error = $2 WHERE event_id = $1")
                    .bind(record.event_id)
                    .bind(route_err.as_processing_error())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| EventStoreError::Database(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

        if let Some(bus) = &self.bus {
            let payload = NotifyPayload::full(&record);
            for channel in [
                stream_channel(&record.stream_type),
                type_channel(&record.event_type),
            ] {
                if let Err(e) = bus.publish(&channel, &payload).await {
                    debug!(channel, error = %e, "notify publish failed");
                }
            }
            if is_trigger {
                if let Err(e) = bus.publish(&self.workflow_channel, &payload).await {
                    warn!(error = %e, "workflow-channel publish failed; backlog sweep will pick the event up");
                }
            }
        }

        debug!(event_id = %record.event_id, stream_version = record.stream_version, "appended event");
        Ok(AppendedEvent {
            event_id: record.event_id,
            stream_version: record.stream_version,
        })
    }

    #[instrument(skip(self))]
    async fn get_event(&self, event_id: Uuid) -> Result<EventRecord, EventStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?
        .ok_or(EventStoreError::EventNotFound(event_id))?;

        row_to_event(&row)
    }

    #[instrument(skip(self))]
    async fn load_stream(
        &self,
        stream_id: Uuid,
        stream_type: &str,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE stream_id = $1 AND stream_type = $2 ORDER BY stream_version"
        ))
        .bind(stream_id)
        .bind(stream_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self, provenance))]
    async fn attach_provenance(
        &self,
        event_id: Uuid,
        provenance: &WorkflowProvenance,
        mark_processed: bool,
    ) -> Result<(), EventStoreError> {
        let mut patch = serde_json::json!({
            "workflow_id": provenance.workflow_id,
            "workflow_run_id": provenance.workflow_run_id,
            "workflow_type": provenance.workflow_type,
            "workflow_timestamp": provenance.timestamp,
        });
        if let Some(activity_id) = &provenance.activity_id {
            patch["activity_id"] = serde_json::Value::String(activity_id.clone());
        }

        let result = sqlx::query(
            r#"
            UPDATE domain_events
            SET event_metadata = CASE
                    WHEN event_metadata ? 'workflow_id' THEN event_metadata
                    ELSE event_metadata || $2
                END,
                processed_at = CASE WHEN $3 THEN COALESCE(processed_at, NOW()) ELSE processed_at END,
                processing_error = CASE WHEN $3 THEN NULL ELSE processing_error END
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(&patch)
        .bind(mark_processed)
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::EventNotFound(event_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_dispatch_failure(
        &self,
        event_id: Uuid,
        error: &str,
    ) -> Result<i32, EventStoreError> {
        let retry_count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE domain_events
            SET processing_error = $2,
                retry_count = retry_count + 1
            WHERE event_id = $1
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to record dispatch failure: {}", e);
            EventStoreError::Database(e.to_string())
        })?;

        retry_count.ok_or(EventStoreError::EventNotFound(event_id))
    }

    #[instrument(skip(self))]
    async fn mark_abandoned(&self, event_id: Uuid, error: &str) -> Result<(), EventStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE domain_events
            SET processed_at = NOW(),
                processing_error = $2
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::EventNotFound(event_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn events_for_workflow(
        &self,
        workflow_id: &str,
        workflow_run_id: Option<Uuid>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let run_filter = workflow_run_id.map(|id| id.to_string());
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE event_metadata->>'workflow_id' = $1 \
               AND ($2::text IS NULL OR event_metadata->>'workflow_run_id' = $2) \
             ORDER BY created_at, stream_version"
        ))
        .bind(workflow_id)
        .bind(&run_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn workflow_summary(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSummary>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS event_count,
                   COUNT(processing_error) AS error_count,
                   MIN(created_at) AS first_event_at,
                   MAX(created_at) AS last_event_at,
                   ARRAY_AGG(DISTINCT event_type) AS event_types,
                   MIN(event_metadata->>'workflow_type') AS workflow_type
            FROM domain_events
            WHERE event_metadata->>'workflow_id' = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        let event_count: i64 = row.get("event_count");
        if event_count == 0 {
            return Ok(None);
        }

        let error_count: i64 = row.get("error_count");
        let mut event_types: Vec<String> = row.get("event_types");
        event_types.sort();

        Ok(Some(WorkflowSummary {
            workflow_id: workflow_id.to_string(),
            workflow_type: row.get("workflow_type"),
            event_types,
            first_event_at: row.get("first_event_at"),
            last_event_at: row.get("last_event_at"),
            event_count: event_count as usize,
            error_count: error_count as usize,
        }))
    }

    #[instrument(skip(self))]
    async fn lineage_for_aggregate(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<AggregateLineage>, EventStoreError> {
        let trigger_types = self.registry.trigger_event_types();
        let root = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE stream_id = $1 AND event_type = ANY($2) \
             ORDER BY stream_version LIMIT 1"
        ))
        .bind(aggregate_id)
        .bind(&trigger_types)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        let Some(root) = root else {
            return Ok(None);
        };
        let root = row_to_event(&root)?;

        let workflow_id = root.event_metadata.workflow_id.clone();
        let events = match workflow_id.as_deref() {
            Some(id) => self.events_for_workflow(id, None).await?,
            None => vec![],
        };

        Ok(Some(AggregateLineage {
            root,
            workflow_id,
            events,
        }))
    }

    #[instrument(skip(self, event_types))]
    async fn unprocessed_triggers(
        &self,
        event_types: &[String],
        older_than: Duration,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE event_type = ANY($1) AND processed_at IS NULL AND created_at <= $2 \
             ORDER BY created_at"
        ))
        .bind(event_types)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn projection_row(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<ProjectionRow>, EventStoreError> {
        let table = table_ident(table)?;
        let row = sqlx::query(&format!(
            "SELECT key, data, created_at, updated_at, deleted_at FROM {table} WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        Ok(row.map(|r| ProjectionRow {
            key: r.get("key"),
            data: r.get("data"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
            deleted_at: r.get("deleted_at"),
        }))
    }
}

/// Only migration-created identifiers reach this point, but table names are
/// interpolated into SQL, so hold the line anyway.
fn table_ident(name: &str) -> Result<&str, EventStoreError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(name)
    } else {
        Err(EventStoreError::Validation(format!(
            "invalid projection table name: {name}"
        )))
    }
}

async fn apply_effect(
    tx: &mut Transaction<'_, Postgres>,
    effect: &ProjectionEffect,
    at: DateTime<Utc>,
) -> Result<(), EventStoreError> {
    let db_err = |e: sqlx::Error| EventStoreError::Database(e.to_string());

    match effect {
        ProjectionEffect::Upsert { table, key, row } => {
            let table = table_ident(table)?;
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (key, data, created_at, updated_at)
                VALUES ($1, $2, $3, $3)
                ON CONFLICT (key) DO UPDATE SET
                    data = {table}.data || EXCLUDED.data,
                    updated_at = EXCLUDED.updated_at
                "#
            ))
            .bind(key)
            .bind(serde_json::Value::Object(row.clone()))
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        ProjectionEffect::UpsertIfNewer { table, key, row } => {
            let table = table_ident(table)?;
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (key, data, created_at, updated_at)
                VALUES ($1, $2, $3, $3)
                ON CONFLICT (key) DO UPDATE SET
                    data = {table}.data || EXCLUDED.data,
                    updated_at = EXCLUDED.updated_at
                WHERE {table}.updated_at <= EXCLUDED.updated_at
                "#
            ))
            .bind(key)
            .bind(serde_json::Value::Object(row.clone()))
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        ProjectionEffect::InsertIgnore { table, key, row } => {
            let table = table_ident(table)?;
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (key, data, created_at, updated_at)
                VALUES ($1, $2, $3, $3)
                ON CONFLICT (key) DO NOTHING
                "#
            ))
            .bind(key)
            .bind(serde_json::Value::Object(row.clone()))
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        ProjectionEffect::Delete { table, key } => {
            let table = table_ident(table)?;
            sqlx::query(&format!("DELETE FROM {table} WHERE key = $1"))
                .bind(key)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
        }

        ProjectionEffect::SoftDelete { table, key } => {
            let table = table_ident(table)?;
            sqlx::query(&format!(
                "UPDATE {table} SET deleted_at = $2, updated_at = $2 WHERE key = $1"
            ))
            .bind(key)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        ProjectionEffect::ArrayAdd {
            table,
            key,
            field,
            value,
        } => {
            let table = table_ident(table)?;
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (key, data, created_at, updated_at)
                VALUES ($1, jsonb_build_object($2::text, jsonb_build_array($3::jsonb)), $4, $4)
                ON CONFLICT (key) DO UPDATE SET
                    data = jsonb_set(
                        {table}.data,
                        ARRAY[$2::text],
                        CASE
                            WHEN COALESCE({table}.data->$2::text, '[]'::jsonb)
                                 @> jsonb_build_array($3::jsonb)
                            THEN COALESCE({table}.data->$2::text, '[]'::jsonb)
                            ELSE COALESCE({table}.data->$2::text, '[]'::jsonb)
                                 || jsonb_build_array($3::jsonb)
                        END
                    ),
                    updated_at = $4
                "#
            ))
            .bind(key)
            .bind(field)
            .bind(value)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        ProjectionEffect::ArrayRemove {
            table,
            key,
            field,
            value,
        } => {
            let table = table_ident(table)?;
            sqlx::query(&format!(
                r#"
                UPDATE {table}
                SET data = jsonb_set(
                        {table}.data,
                        ARRAY[$2::text],
                        (SELECT COALESCE(jsonb_agg(elem), '[]'::jsonb)
                         FROM jsonb_array_elements(
                             COALESCE({table}.data->$2::text, '[]'::jsonb)) AS elem
                         WHERE elem <> $3::jsonb)
                    ),
                    updated_at = $4
                WHERE key = $1
                "#
            ))
            .bind(key)
            .bind(field)
            .bind(value)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
    }

    Ok(())
}

fn row_to_event(row: &PgRow) -> Result<EventRecord, EventStoreError> {
    let metadata_json: serde_json::Value = row.get("event_metadata");
    let event_metadata = serde_json::from_value(metadata_json)
        .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

    Ok(EventRecord {
        event_id: row.get("event_id"),
        stream_id: row.get("stream_id"),
        stream_type: row.get("stream_type"),
        stream_version: row.get("stream_version"),
        event_type: row.get("event_type"),
        event_data: row.get("event_data"),
        event_metadata,
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        processing_error: row.get("processing_error"),
        retry_count: row.get("retry_count"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ident() {
        assert!(table_ident("organizations").is_ok());
        assert!(table_ident("user_roles2").is_ok());
        assert!(table_ident("").is_err());
        assert!(table_ident("bad-name").is_err());
        assert!(table_ident("drop table x;").is_err());
        assert!(table_ident("Roles").is_err());
    }
}
