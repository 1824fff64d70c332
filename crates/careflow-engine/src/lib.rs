//! # Careflow Engine
//!
//! The durable workflow engine behind the orchestration core.
//!
//! ## Contract
//!
//! - **Idempotent identity**: workflows are keyed by deterministic string
//!   ids; starting the same id twice yields `AlreadyExists` with the
//!   winning run, which callers treat as success.
//! - **Replay-based recovery**: each run owns an append-only event
//!   history; state machines are rebuilt by replaying it, so a crashed
//!   worker resumes exactly where the history ends.
//! - **Activities are the I/O boundary**: retried with kind-aware
//!   exponential backoff, bounded by start-to-close timeouts, and able to
//!   emit domain events stamped with workflow provenance.
//! - **Saga compensation**: side-effecting steps register compensations;
//!   on failure or cancellation they run in reverse order, best-effort,
//!   each emitting its own audit events.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine (client)                      │
//! │        start / get / cancel / signal  (WorkflowStarter)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                       │
//! │   (replays run histories, processes actions, drives Saga)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EngineStore                          │
//! │  (executions, run events, task queue, timers, signals)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                          │
//! │     (claims tasks, executes activities, runs the sweeps)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, EventEmitter};
    pub use crate::engine::{
        ActivityRegistry, Engine, EngineError, ExecutorError, StartOptions, StartedRun,
        WorkflowExecution, WorkflowExecutor, WorkflowRegistry, WorkflowStarter,
    };
    pub use crate::persistence::{
        CancellationPolicy, EngineStore, InMemoryEngineStore, PostgresEngineStore, ReusePolicy,
        WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{LocalRunner, WorkerPool, WorkerPoolConfig};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowSignal,
    };
}

pub use activity::{Activity, ActivityContext, ActivityError, EmitOutcome, EventEmitter};
pub use engine::{
    ActivityRegistry, AnyWorkflow, Engine, EngineError, ExecutorError, RegistryError,
    StartOptions, StartedRun, WorkflowExecution, WorkflowExecutor, WorkflowRegistry,
    WorkflowStarter,
};
pub use persistence::{
    CancellationPolicy, ClaimedTask, EngineStore, EngineStoreError, ExecutionRecord,
    InMemoryEngineStore, NewExecution, PostgresEngineStore, ReusePolicy, TaskDefinition,
    TaskFailureOutcome, TaskKind, TimerRecord, WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{
    LocalRunner, RunnerError, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
pub use workflow::{ActivityOptions, RunEvent, Workflow, WorkflowAction, WorkflowError, WorkflowSignal};
