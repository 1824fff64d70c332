//! Per-stream projection handlers
//!
//! Every handler is a pure function from an event to effects. Handlers
//! only ever touch their own projection table; anything cross-aggregate
//! happens through further events, never here.

use careflow_core::event::EventRecord;
use serde_json::{Map, Value};

use super::{ProjectionEffect, ProjectionError};

/// The last dotted segment of an event type (`role.created` -> `created`).
fn suffix(event_type: &str) -> &str {
    event_type.rsplit('.').next().unwrap_or(event_type)
}

/// Row content for an event: the payload object plus the aggregate id.
fn row_from_payload(event: &EventRecord) -> Map<String, Value> {
    let mut row = event
        .event_data
        .as_object()
        .cloned()
        .unwrap_or_default();
    row.insert("id".to_string(), Value::String(event.stream_id.to_string()));
    row
}

fn unknown(event: &EventRecord) -> ProjectionError {
    ProjectionError::UnknownEventType {
        stream_type: event.stream_type.clone(),
        event_type: event.event_type.clone(),
    }
}

fn require_str<'a>(event: &'a EventRecord, field: &str) -> Result<&'a str, ProjectionError> {
    event
        .event_data
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProjectionError::MissingField {
            event_type: event.event_type.clone(),
            field: field.to_string(),
        })
}

/// Generic created/updated/deleted lifecycle shared by the schematic
/// entity streams.
pub mod lifecycle {
    use super::*;

    pub fn apply(
        event: &EventRecord,
        table: &str,
    ) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        try_apply(event, table)?.ok_or_else(|| unknown(event)).map(|e| vec![e])
    }

    /// `Ok(None)` when the suffix is not a lifecycle verb, so specialised
    /// handlers can fall through to their own cases.
    pub fn try_apply(
        event: &EventRecord,
        table: &str,
    ) -> Result<Option<ProjectionEffect>, ProjectionError> {
        let key = event.stream_id.to_string();
        let effect = match suffix(&event.event_type) {
            "created" => ProjectionEffect::InsertIgnore {
                table: table.to_string(),
                key,
                row: row_from_payload(event),
            },
            "updated" => ProjectionEffect::UpsertIfNewer {
                table: table.to_string(),
                key,
                row: row_from_payload(event),
            },
            "deleted" => ProjectionEffect::SoftDelete {
                table: table.to_string(),
                key,
            },
            _ => return Ok(None),
        };
        Ok(Some(effect))
    }
}

pub mod organization {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        let table = "organizations".to_string();
        let key = event.stream_id.to_string();

        let effect = match event.event_type.as_str() {
            // The trigger event seeds a provisional row so operators can
            // see the organization while its workflow runs.
            "organization.bootstrap.initiated" => {
                let mut row = Map::new();
                row.insert("id".to_string(), Value::String(key.clone()));
                row.insert(
                    "subdomain".to_string(),
                    Value::String(require_str(event, "subdomain")?.to_string()),
                );
                row.insert("status".to_string(), Value::String("provisioning".into()));
                ProjectionEffect::InsertIgnore { table, key, row }
            }
            "organization.created" => {
                let mut row = row_from_payload(event);
                row.insert("status".to_string(), Value::String("created".into()));
                ProjectionEffect::Upsert { table, key, row }
            }
            "organization.updated" => ProjectionEffect::UpsertIfNewer {
                table,
                key,
                row: row_from_payload(event),
            },
            "organization.activated" => {
                let mut row = Map::new();
                row.insert("status".to_string(), Value::String("active".into()));
                ProjectionEffect::Upsert { table, key, row }
            }
            "organization.deactivated" => {
                let mut row = Map::new();
                row.insert("status".to_string(), Value::String("inactive".into()));
                if let Some(reason) = event.event_data.get("reason") {
                    row.insert("deactivation_reason".to_string(), reason.clone());
                }
                ProjectionEffect::Upsert { table, key, row }
            }
            "dns.configured" => {
                let mut row = Map::new();
                row.insert("dns_status".to_string(), Value::String("configured".into()));
                if let Some(record) = event.event_data.get("record") {
                    row.insert("dns_record".to_string(), record.clone());
                }
                ProjectionEffect::Upsert { table, key, row }
            }
            "dns.removed" => {
                let mut row = Map::new();
                row.insert("dns_status".to_string(), Value::String("removed".into()));
                row.insert("dns_record".to_string(), Value::Null);
                ProjectionEffect::Upsert { table, key, row }
            }
            _ => return Err(unknown(event)),
        };

        Ok(vec![effect])
    }
}

pub mod invitation {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        let table = "invitations".to_string();
        let key = event.stream_id.to_string();

        let effect = match event.event_type.as_str() {
            "invitation.created" => {
                let mut row = row_from_payload(event);
                row.insert("status".to_string(), Value::String("pending".into()));
                ProjectionEffect::InsertIgnore { table, key, row }
            }
            "invitation.email.sent" => {
                let mut row = Map::new();
                row.insert("status".to_string(), Value::String("sent".into()));
                if let Some(message_id) = event.event_data.get("message_id") {
                    row.insert("message_id".to_string(), message_id.clone());
                }
                ProjectionEffect::UpsertIfNewer { table, key, row }
            }
            "invitation.accepted" => status_row(table, key, "accepted"),
            "invitation.cancelled" => {
                let mut row = Map::new();
                row.insert("status".to_string(), Value::String("cancelled".into()));
                if let Some(reason) = event.event_data.get("reason") {
                    row.insert("cancel_reason".to_string(), reason.clone());
                }
                ProjectionEffect::Upsert { table, key, row }
            }
            "invitation.expired" => status_row(table, key, "expired"),
            _ => return Err(unknown(event)),
        };

        Ok(vec![effect])
    }

    fn status_row(table: String, key: String, status: &str) -> ProjectionEffect {
        let mut row = Map::new();
        row.insert("status".to_string(), Value::String(status.into()));
        ProjectionEffect::UpsertIfNewer { table, key, row }
    }
}

pub mod role {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        if let Some(effect) = lifecycle::try_apply(event, "roles")? {
            return Ok(vec![effect]);
        }

        let key = event.stream_id.to_string();
        let effect = match event.event_type.as_str() {
            "role.permission.granted" => ProjectionEffect::ArrayAdd {
                table: "roles".to_string(),
                key,
                field: "permissions".to_string(),
                value: Value::String(require_str(event, "permission")?.to_string()),
            },
            "role.permission.revoked" => ProjectionEffect::ArrayRemove {
                table: "roles".to_string(),
                key,
                field: "permissions".to_string(),
                value: Value::String(require_str(event, "permission")?.to_string()),
            },
            _ => return Err(unknown(event)),
        };

        Ok(vec![effect])
    }
}

pub mod user {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        if let Some(effect) = lifecycle::try_apply(event, "users")? {
            return Ok(vec![effect]);
        }

        match event.event_type.as_str() {
            "user.deactivated" => {
                let mut row = Map::new();
                row.insert("active".to_string(), Value::Bool(false));
                Ok(vec![ProjectionEffect::UpsertIfNewer {
                    table: "users".to_string(),
                    key: event.stream_id.to_string(),
                    row,
                }])
            }
            _ => Err(unknown(event)),
        }
    }
}

pub mod impersonation {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        let table = "impersonations".to_string();
        let key = event.stream_id.to_string();

        let effect = match event.event_type.as_str() {
            "impersonation.started" => {
                let mut row = row_from_payload(event);
                row.insert("active".to_string(), Value::Bool(true));
                row.insert(
                    "started_at".to_string(),
                    Value::String(event.created_at.to_rfc3339()),
                );
                ProjectionEffect::InsertIgnore { table, key, row }
            }
            "impersonation.ended" => {
                let mut row = Map::new();
                row.insert("active".to_string(), Value::Bool(false));
                row.insert(
                    "ended_at".to_string(),
                    Value::String(event.created_at.to_rfc3339()),
                );
                ProjectionEffect::UpsertIfNewer { table, key, row }
            }
            _ => return Err(unknown(event)),
        };

        Ok(vec![effect])
    }
}

pub mod medication {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        if let Some(effect) = lifecycle::try_apply(event, "medications")? {
            return Ok(vec![effect]);
        }

        match event.event_type.as_str() {
            "medication.discontinued" => {
                let mut row = Map::new();
                row.insert("status".to_string(), Value::String("discontinued".into()));
                Ok(vec![ProjectionEffect::UpsertIfNewer {
                    table: "medications".to_string(),
                    key: event.stream_id.to_string(),
                    row,
                }])
            }
            _ => Err(unknown(event)),
        }
    }
}

pub mod medication_history {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        match event.event_type.as_str() {
            // History entries are immutable; one row per stream.
            "medication_history.recorded" => Ok(vec![ProjectionEffect::InsertIgnore {
                table: "medication_histories".to_string(),
                key: event.stream_id.to_string(),
                row: row_from_payload(event),
            }]),
            _ => Err(unknown(event)),
        }
    }
}

pub mod access_grant {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        let table = "access_grants".to_string();
        let key = event.stream_id.to_string();

        let effect = match event.event_type.as_str() {
            "access_grant.created" => ProjectionEffect::InsertIgnore {
                table,
                key,
                row: row_from_payload(event),
            },
            "access_grant.revoked" => {
                let mut row = Map::new();
                row.insert("status".to_string(), Value::String("revoked".into()));
                ProjectionEffect::UpsertIfNewer { table, key, row }
            }
            _ => return Err(unknown(event)),
        };

        Ok(vec![effect])
    }
}

/// Generic junction handler: `<name>.linked` inserts a pair row into the
/// join table named by the stream (`junction.user_roles` -> `user_roles`),
/// `<name>.unlinked` deletes it.
pub mod junction {
    use super::*;

    pub fn apply(event: &EventRecord) -> Result<Vec<ProjectionEffect>, ProjectionError> {
        let table = event
            .stream_type
            .strip_prefix("junction.")
            .ok_or_else(|| unknown(event))?
            .to_string();

        let left = require_str(event, "left_id")?.to_string();
        let right = require_str(event, "right_id")?.to_string();
        let key = format!("{left}:{right}");

        let effect = if event.event_type.ends_with(".linked") {
            let mut row = Map::new();
            row.insert("left_id".to_string(), Value::String(left));
            row.insert("right_id".to_string(), Value::String(right));
            ProjectionEffect::InsertIgnore { table, key, row }
        } else {
            ProjectionEffect::Delete { table, key }
        };

        Ok(vec![effect])
    }
}
