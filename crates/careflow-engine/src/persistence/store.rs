//! EngineStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, RunEvent, WorkflowError, WorkflowSignal};

/// Errors from engine-store operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineStoreError {
    /// A workflow with this id already exists and reuse does not apply.
    /// Carries the winning run so callers can treat it as success.
    #[error("workflow already exists: {workflow_id} (run {run_id}, {status})")]
    AlreadyExists {
        workflow_id: String,
        run_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Optimistic concurrency failure on the run history
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow execution status.
///
/// `Pending`/`Running`/`Compensating` are live; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Compensating,
    Completed,
    Failed,
    Compensated,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Compensated | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineStoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "compensating" => Ok(Self::Compensating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensated" => Ok(Self::Compensated),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EngineStoreError::Database(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duplicate-start handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Reject any duplicate id, running or terminated
    #[default]
    RejectDuplicate,

    /// Allow a fresh run when the previous one reached a terminal state
    AllowAfterTerminal,
}

/// What happens to pending child work when the workflow closes.
///
/// Only one policy is defined today; it exists as an explicit option so
/// trigger wiring states it rather than implying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    #[default]
    AbandonPendingChildren,
}

/// A new execution to persist.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub task_queue: String,
    pub deadline_at: Option<DateTime<Utc>>,
    pub cancellation_policy: CancellationPolicy,
}

/// A persisted execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub task_queue: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

/// Regular activity or Saga compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Activity,
    Compensation,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Compensation => "compensation",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineStoreError> {
        match value {
            "activity" => Ok(Self::Activity),
            "compensation" => Ok(Self::Compensation),
            other => Err(EngineStoreError::Database(format!(
                "unknown task kind: {other}"
            ))),
        }
    }
}

/// A task to enqueue.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub activity_id: String,
    pub activity_type: String,
    pub kind: TaskKind,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// A task claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub activity_id: String,
    pub activity_type: String,
    pub kind: TaskKind,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Outcome of failing a task.
#[derive(Debug, Clone)]
pub enum TaskFailureOutcome {
    /// Requeued with a delay
    WillRetry { next_attempt: u32, delay: Duration },

    /// No more attempts; the failure surfaces to the workflow
    Exhausted,
}

/// A durable timer.
#[derive(Debug, Clone)]
pub struct TimerRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

/// Durable state behind the engine.
///
/// Implementations must be thread-safe; the uniqueness of `workflow_id`
/// is the engine's idempotency guarantee and must hold under concurrent
/// creates.
#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // =========================================================================
    // Executions
    // =========================================================================

    /// Persist a new execution. Returns `AlreadyExists` when the id is
    /// taken, unless `reuse` permits a fresh run after a terminal one.
    async fn create_workflow(
        &self,
        new: NewExecution,
        reuse: ReusePolicy,
    ) -> Result<(), EngineStoreError>;

    async fn get_execution(&self, workflow_id: &str) -> Result<ExecutionRecord, EngineStoreError>;

    async fn get_execution_by_run(&self, run_id: Uuid)
        -> Result<ExecutionRecord, EngineStoreError>;

    /// Update status; terminal statuses stamp `ended_at`, `Running` stamps
    /// `started_at`.
    async fn update_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), EngineStoreError>;

    /// Live executions whose deadline has passed.
    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, EngineStoreError>;

    // =========================================================================
    // Run history
    // =========================================================================

    /// Append events with optimistic concurrency; returns the new sequence.
    async fn append_run_events(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        events: Vec<RunEvent>,
    ) -> Result<i64, EngineStoreError>;

    /// Full history in sequence order.
    async fn load_run_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<(i64, RunEvent)>, EngineStoreError>;

    // =========================================================================
    // Task queue
    // =========================================================================

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, EngineStoreError>;

    /// Claim due tasks from the given queues (bumps `attempt`).
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queues: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, EngineStoreError>;

    async fn complete_task(&self, task_id: Uuid) -> Result<(), EngineStoreError>;

    /// Fail a task. Retries when the error is retryable and attempts
    /// remain, honoring `retry_after` over the computed backoff.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
        retry_after: Option<Duration>,
    ) -> Result<TaskFailureOutcome, EngineStoreError>;

    /// Drop pending tasks of a run (cancellation path). Returns how many.
    async fn cancel_pending_tasks(&self, run_id: Uuid) -> Result<usize, EngineStoreError>;

    /// Requeue claimed tasks whose worker went silent.
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, EngineStoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    async fn schedule_timer(
        &self,
        run_id: Uuid,
        workflow_id: &str,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), EngineStoreError>;

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerRecord>, EngineStoreError>;

    async fn mark_timer_fired(&self, id: Uuid) -> Result<(), EngineStoreError>;

    // =========================================================================
    // Signals
    // =========================================================================

    async fn send_signal(
        &self,
        run_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<(), EngineStoreError>;

    async fn pending_signals(&self, run_id: Uuid)
        -> Result<Vec<WorkflowSignal>, EngineStoreError>;

    async fn mark_signals_processed(
        &self,
        run_id: Uuid,
        count: usize,
    ) -> Result<(), EngineStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Compensating.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Compensated.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Compensating,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Compensated,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(WorkflowStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(WorkflowStatus::parse("exploded").is_err());
    }

    #[test]
    fn test_task_kind_parse() {
        assert_eq!(TaskKind::parse("activity").unwrap(), TaskKind::Activity);
        assert_eq!(
            TaskKind::parse("compensation").unwrap(),
            TaskKind::Compensation
        );
        assert!(TaskKind::parse("other").is_err());
    }
}
