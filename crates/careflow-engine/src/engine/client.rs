//! Engine client surface
//!
//! [`WorkflowStarter`] is the contract the trigger listener and operators
//! program against: start (idempotent), get, cancel. [`Engine`] implements
//! it over a [`WorkflowExecutor`] and the configured workflow defaults.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use careflow_core::config::WorkflowDefaults;

use crate::persistence::{
    CancellationPolicy, EngineStore, EngineStoreError, ReusePolicy, WorkflowStatus,
};
use crate::workflow::{WorkflowError, WorkflowSignal};

use super::executor::{ExecutorError, WorkflowExecutor};
use super::registry::RegistryError;

/// Errors surfaced by the engine client.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A workflow with this id already exists; carries the winning run so
    /// callers can treat the start as already done
    #[error("workflow already exists: {workflow_id}")]
    AlreadyExists { workflow_id: String, run_id: Uuid },

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {0} is already in a terminal state")]
    Terminal(String),

    #[error(transparent)]
    Internal(ExecutorError),
}

impl From<ExecutorError> for EngineError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Store(EngineStoreError::AlreadyExists {
                workflow_id,
                run_id,
                ..
            }) => Self::AlreadyExists {
                workflow_id,
                run_id,
            },
            ExecutorError::Store(EngineStoreError::WorkflowNotFound(id)) => Self::NotFound(id),
            ExecutorError::Registry(RegistryError::UnknownWorkflowType(t)) => {
                Self::UnknownWorkflowType(t)
            }
            ExecutorError::WorkflowTerminal(id) => Self::Terminal(id),
            other => Self::Internal(other),
        }
    }
}

/// Options for starting a workflow.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Deterministic workflow id; the idempotency key
    pub workflow_id: String,

    /// Task queue override (defaults to the configured queue)
    pub task_queue: Option<String>,

    pub reuse: ReusePolicy,

    /// Wall-clock timeout override (defaults to the configured timeout)
    pub timeout: Option<Duration>,

    pub cancellation_policy: CancellationPolicy,
}

impl StartOptions {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_queue: None,
            reuse: ReusePolicy::default(),
            timeout: None,
            cancellation_policy: CancellationPolicy::default(),
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_reuse(mut self, reuse: ReusePolicy) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successfully started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedRun {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// The workflow-status view served to operators and the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<WorkflowError>,
}

/// The engine contract consumed by the trigger listener and operators.
#[async_trait]
pub trait WorkflowStarter: Send + Sync + 'static {
    /// Start a workflow. Duplicate ids return `AlreadyExists` with the
    /// winning run.
    async fn start(
        &self,
        workflow_type: &str,
        params: serde_json::Value,
        options: StartOptions,
    ) -> Result<StartedRun, EngineError>;

    /// Latest run for a workflow id.
    async fn get(&self, workflow_id: &str) -> Result<WorkflowExecution, EngineError>;

    /// Cancel a live workflow; compensations run before it settles.
    async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError>;
}

/// The in-process engine.
pub struct Engine<S: EngineStore> {
    executor: Arc<WorkflowExecutor<S>>,
    defaults: WorkflowDefaults,
}

impl<S: EngineStore> Engine<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>, defaults: WorkflowDefaults) -> Self {
        Self { executor, defaults }
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<S>> {
        &self.executor
    }

    /// Send an external signal and deliver it immediately.
    pub async fn signal(
        &self,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), EngineError> {
        let record = self
            .executor
            .store()
            .get_execution(workflow_id)
            .await
            .map_err(|e| EngineError::from(ExecutorError::from(e)))?;

        if record.status.is_terminal() {
            return Err(EngineError::Terminal(workflow_id.to_string()));
        }

        self.executor
            .store()
            .send_signal(record.run_id, signal)
            .await
            .map_err(|e| EngineError::from(ExecutorError::from(e)))?;
        self.executor
            .process_signals(record.run_id)
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }
}

#[async_trait]
impl<S: EngineStore> WorkflowStarter for Engine<S> {
    async fn start(
        &self,
        workflow_type: &str,
        params: serde_json::Value,
        options: StartOptions,
    ) -> Result<StartedRun, EngineError> {
        let task_queue = options
            .task_queue
            .unwrap_or_else(|| self.defaults.task_queue.clone());
        let timeout = options.timeout.unwrap_or(self.defaults.timeout);
        let deadline_at = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();

        let run_id = self
            .executor
            .start_workflow(
                workflow_type,
                &options.workflow_id,
                params,
                &task_queue,
                Some(deadline_at),
                options.reuse,
                options.cancellation_policy,
            )
            .await?;

        debug!(workflow_id = %options.workflow_id, %run_id, "workflow started");
        Ok(StartedRun {
            workflow_id: options.workflow_id,
            run_id,
        })
    }

    async fn get(&self, workflow_id: &str) -> Result<WorkflowExecution, EngineError> {
        let record = self
            .executor
            .store()
            .get_execution(workflow_id)
            .await
            .map_err(|e| EngineError::from(ExecutorError::from(e)))?;

        Ok(WorkflowExecution {
            workflow_id: record.workflow_id,
            run_id: record.run_id,
            workflow_type: record.workflow_type,
            status: record.status,
            started_at: record.started_at,
            ended_at: record.ended_at,
            error: record.error,
        })
    }

    async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError> {
        self.executor
            .cancel_workflow(workflow_id, reason)
            .await
            .map_err(EngineError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::persistence::InMemoryEngineStore;
    use crate::workflow::{Workflow, WorkflowAction};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct NoopInput {}

    struct NoopWorkflow {
        done: bool,
    }

    impl Workflow for NoopWorkflow {
        const TYPE: &'static str = "noop";
        type Input = NoopInput;
        type Output = NoopInput;

        fn new(_input: Self::Input) -> Self {
            Self { done: false }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "wait",
                "wait_activity",
                json!({}),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _: &str,
            _: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            self.done = true;
            vec![WorkflowAction::complete(json!({}))]
        }

        fn on_activity_failed(&mut self, _: &str, _: &ActivityError) -> Vec<WorkflowAction> {
            vec![]
        }

        fn is_completed(&self) -> bool {
            self.done
        }

        fn result(&self) -> Option<Self::Output> {
            self.done.then_some(NoopInput {})
        }
    }

    fn engine() -> Engine<InMemoryEngineStore> {
        let mut executor = WorkflowExecutor::new(Arc::new(InMemoryEngineStore::new()));
        executor.register::<NoopWorkflow>();
        Engine::new(Arc::new(executor), WorkflowDefaults::default())
    }

    #[tokio::test]
    async fn test_start_and_get() {
        let engine = engine();
        let started = engine
            .start("noop", json!({}), StartOptions::new("noop-1"))
            .await
            .unwrap();
        assert_eq!(started.workflow_id, "noop-1");

        let execution = engine.get("noop-1").await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Running);
        assert_eq!(execution.run_id, started.run_id);
        assert!(execution.started_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_already_exists() {
        let engine = engine();
        let first = engine
            .start("noop", json!({}), StartOptions::new("noop-dup"))
            .await
            .unwrap();

        let second = engine
            .start("noop", json!({}), StartOptions::new("noop-dup"))
            .await;

        match second {
            Err(EngineError::AlreadyExists {
                workflow_id,
                run_id,
            }) => {
                assert_eq!(workflow_id, "noop-dup");
                assert_eq!(run_id, first.run_id);
            }
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let engine = engine();
        let result = engine
            .start("missing", json!({}), StartOptions::new("x"))
            .await;
        assert!(matches!(result, Err(EngineError::UnknownWorkflowType(_))));
    }

    #[tokio::test]
    async fn test_get_unknown_workflow() {
        let engine = engine();
        assert!(matches!(
            engine.get("ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_live_workflow() {
        let engine = engine();
        engine
            .start("noop", json!({}), StartOptions::new("noop-cancel"))
            .await
            .unwrap();

        engine.cancel("noop-cancel", "tests").await.unwrap();
        let execution = engine.get("noop-cancel").await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Cancelled);
    }
}
