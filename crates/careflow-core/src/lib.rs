//! # Careflow Core
//!
//! Shared vocabulary for the event-driven orchestration core:
//!
//! - the append-only domain-event envelope and its metadata, including
//!   workflow provenance
//! - the event-type registry with declarative payload schemas and trigger
//!   wiring
//! - the error-kind taxonomy that drives retry and compensation decisions
//! - enumerated configuration for the listener, backlog sweep, engine and
//!   worker
//!
//! This crate holds no I/O; the store, engine and listener crates build on
//! these types.

pub mod config;
pub mod error;
pub mod event;
pub mod metadata;
pub mod registry;
pub mod schema;

pub use config::{
    ActivityDefaults, BackoffConfig, BacklogConfig, CoreConfig, ListenerConfig, WorkerConfig,
    WorkflowDefaults,
};
pub use error::ErrorKind;
pub use event::{AppendEvent, AppendedEvent, EventRecord};
pub use metadata::{EventMetadata, WorkflowProvenance};
pub use registry::{EventTypeRegistry, EventTypeSpec, RegistryError, TriggerSpec};
pub use schema::{FieldKind, FieldSpec, PayloadSchema, SchemaViolation};
