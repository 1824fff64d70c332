//! Type-erased registries for workflows and activities
//!
//! Factories create workflow instances from JSON input without knowing
//! the concrete type at runtime; activity handlers erase typed
//! `Activity` implementations into JSON-in/JSON-out closures the worker
//! pool can dispatch by name.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::workflow::{Workflow, WorkflowAction, WorkflowError, WorkflowSignal};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// Type-erased workflow interface used by the executor during replay.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;
    fn on_start(&mut self) -> Vec<WorkflowAction>;
    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction>;
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;
    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction>;
    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction>;
    fn on_timeout(&mut self) -> Vec<WorkflowAction>;
    fn is_completed(&self) -> bool;
    fn result_json(&self) -> Option<Value>;
    fn error(&self) -> Option<WorkflowError>;
}

struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        self.inner.on_start()
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        self.inner.on_activity_completed(activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.inner.on_activity_failed(activity_id, error)
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        self.inner.on_timer_fired(timer_id)
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        self.inner.on_signal(signal)
    }

    fn on_timeout(&mut self) -> Vec<WorkflowAction> {
        self.inner.on_timeout()
    }

    fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    fn result_json(&self) -> Option<Value> {
        self.inner
            .result()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
    }

    fn error(&self) -> Option<WorkflowError> {
        self.inner.error()
    }
}

type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories.
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type.
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed: W::Input = serde_json::from_value(input)?;
            Ok(Box::new(WorkflowWrapper { inner: W::new(typed) }) as Box<dyn AnyWorkflow>)
        });
        self.factories.insert(W::TYPE.to_string(), factory);
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Instantiate a workflow from its type name and JSON input.
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;
        factory(input).map_err(RegistryError::Deserialization)
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

type ActivityHandler = Arc<
    dyn Fn(
            ActivityContext,
            Value,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send>>
        + Send
        + Sync,
>;

/// Registry of activity implementations, keyed by `Activity::TYPE`.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity instance (instances carry their dependencies).
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx, input| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let typed: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::validation(format!("invalid activity input: {e}"))
                })?;
                let output = activity.execute(&ctx, typed).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::validation(format!("unserializable activity output: {e}"))
                })
            })
        });
        self.handlers.insert(A::TYPE.to_string(), handler);
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Execute an activity by type name.
    pub async fn execute(
        &self,
        activity_type: &str,
        ctx: ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let handler = self.handlers.get(activity_type).ok_or_else(|| {
            ActivityError::validation(format!("no activity registered for type {activity_type}"))
        })?;
        handler(ctx, input).await
    }

    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
