//! Durable engine state: executions, run histories, tasks, timers, signals

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEngineStore;
pub use postgres::PostgresEngineStore;
pub use store::{
    CancellationPolicy, ClaimedTask, EngineStore, EngineStoreError, ExecutionRecord, NewExecution,
    ReusePolicy, TaskDefinition, TaskFailureOutcome, TaskKind, TimerRecord, WorkflowStatus,
};
