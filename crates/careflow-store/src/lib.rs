//! # Careflow Store
//!
//! The event store and CQRS layer of the orchestration core:
//!
//! - **Event store**: append-only log with per-stream monotonic versions,
//!   validated against the event-type registry. Appends to different
//!   streams proceed in parallel; within a stream the version constraint
//!   serializes writers and the loser retries on `VersionConflict`.
//! - **Projections**: every append synchronously routes the event to its
//!   pure projection handler and applies the resulting effects in the same
//!   unit of work. Projector failure never rolls back the event.
//! - **Notify bus**: best-effort pub-sub (in-process broadcast or
//!   Postgres LISTEN/NOTIFY) publishing trigger events after commit.
//! - **Query surface**: workflow traceability, events-for-workflow,
//!   workflow summaries, aggregate lineage, and the backlog work list.
//!
//! Two interchangeable backends: [`PostgresEventStore`] for production and
//! [`InMemoryEventStore`] for tests and single-process use.

pub mod error;
pub mod memory;
pub mod notify;
pub mod postgres;
pub mod projection;
pub mod store;

pub use error::EventStoreError;
pub use memory::{InMemoryEventStore, ProjectionTables};
pub use notify::{
    stream_channel, type_channel, InProcessNotifyBus, NotifiedEvent, NotifyBus, NotifyError,
    NotifyPayload, NotifySubscription, PgNotifyBus,
};
pub use postgres::PostgresEventStore;
pub use projection::{ProjectionEffect, ProjectionError};
pub use store::{
    append_with_retry, AggregateLineage, EventStore, ProjectionRow, WorkflowSummary,
};

/// Embedded migrations (domain events, projections, engine state).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
