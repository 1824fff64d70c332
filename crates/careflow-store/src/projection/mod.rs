//! Projection router and handlers (C2)
//!
//! Handlers are pure: given an event they compute a list of
//! [`ProjectionEffect`]s, and the store applies those effects inside the
//! append transaction. Purity keeps handlers trivially idempotent and
//! makes full replay a matter of re-running the same functions over the
//! log in stream-version order.
//!
//! All timestamps written into projections come from `event.created_at`,
//! never from the wall clock, so a replayed projection is byte-equivalent
//! to the live one.

mod handlers;

use careflow_core::event::EventRecord;
use careflow_core::registry::EventTypeRegistry;
use serde_json::Value;

/// A single change to a projection table.
///
/// `row` objects are shallow-merged into the existing row data, mirroring
/// `data || EXCLUDED.data` on the Postgres side.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionEffect {
    /// Insert, or merge into the existing row
    Upsert {
        table: String,
        key: String,
        row: serde_json::Map<String, Value>,
    },

    /// Insert, or merge only when the existing row is not newer than the
    /// event (guards out-of-order retries)
    UpsertIfNewer {
        table: String,
        key: String,
        row: serde_json::Map<String, Value>,
    },

    /// Insert, no-op on conflict
    InsertIgnore {
        table: String,
        key: String,
        row: serde_json::Map<String, Value>,
    },

    /// Remove the row entirely (junction unlink)
    Delete { table: String, key: String },

    /// Stamp `deleted_at` without removing content
    SoftDelete { table: String, key: String },

    /// Add an element to an array column if absent
    ArrayAdd {
        table: String,
        key: String,
        field: String,
        value: Value,
    },

    /// Remove all matching elements from an array column
    ArrayRemove {
        table: String,
        key: String,
        field: String,
        value: Value,
    },
}

impl ProjectionEffect {
    pub fn table(&self) -> &str {
        match self {
            Self::Upsert { table, .. }
            | Self::UpsertIfNewer { table, .. }
            | Self::InsertIgnore { table, .. }
            | Self::Delete { table, .. }
            | Self::SoftDelete { table, .. }
            | Self::ArrayAdd { table, .. }
            | Self::ArrayRemove { table, .. } => table,
        }
    }
}

/// A handler's refusal to project an event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProjectionError {
    /// Known stream type, unhandled event type. Recorded on the event as
    /// `unknown_event_type`; never aborts the append.
    #[error("no handler for ({stream_type}, {event_type})")]
    UnknownEventType {
        stream_type: String,
        event_type: String,
    },

    /// Payload was missing a field the handler needs
    #[error("projection for {event_type} requires field `{field}`")]
    MissingField { event_type: String, field: String },
}

impl ProjectionError {
    /// The string recorded in `processing_error`.
    pub fn as_processing_error(&self) -> String {
        match self {
            Self::UnknownEventType { .. } => "unknown_event_type".to_string(),
            other => other.to_string(),
        }
    }
}

/// Dispatch an event to its handler.
///
/// The router is a tagged switch over `(stream_type, event_type)`; junction
/// events (`*.linked` / `*.unlinked`) go to the generic junction handler,
/// everything else to its per-stream handler.
pub fn route(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
    if EventTypeRegistry::is_junction_event(&event.event_type) {
        return handlers::junction::apply(event);
    }

    // Operational alert events attach to the stream they concern but have
    // no read-model counterpart.
    if event.event_type.starts_with("workflow.") {
        return Ok(vec![]);
    }

    match event.stream_type.as_str() {
        "organization" => handlers::organization::apply(event),
        "invitation" => handlers::invitation::apply(event),
        "role" => handlers::role::apply(event),
        "permission" => handlers::lifecycle::apply(event, "permissions"),
        "user" => handlers::user::apply(event),
        "contact" => handlers::lifecycle::apply(event, "contacts"),
        "address" => handlers::lifecycle::apply(event, "addresses"),
        "phone" => handlers::lifecycle::apply(event, "phones"),
        "impersonation" => handlers::impersonation::apply(event),
        "client" => handlers::lifecycle::apply(event, "clients"),
        "medication" => handlers::medication::apply(event),
        "medication_history" => handlers::medication_history::apply(event),
        "access_grant" => handlers::access_grant::apply(event),
        "organization_unit" => handlers::lifecycle::apply(event, "organization_units"),
        "dosage" => handlers::lifecycle::apply(event, "dosages"),
        _ => Err(ProjectionError::UnknownEventType {
            stream_type: event.stream_type.clone(),
            event_type: event.event_type.clone(),
        }),
    }
}
