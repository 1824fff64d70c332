//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use careflow_core::error::ErrorKind;

use super::{WorkflowAction, WorkflowSignal};
use crate::activity::ActivityError;

/// Error type for workflow failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    pub message: String,

    pub kind: ErrorKind,

    /// The originating domain event, when known. Operators follow this id
    /// through the event-query surface to reconstruct the whole saga.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Unknown,
            correlation_id: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn timed_out() -> Self {
        Self {
            message: "workflow exceeded its execution timeout".to_string(),
            kind: ErrorKind::Timeout,
            correlation_id: None,
        }
    }
}

impl From<&ActivityError> for WorkflowError {
    fn from(err: &ActivityError) -> Self {
        Self {
            message: err.message.clone(),
            kind: err.kind,
            correlation_id: None,
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a deterministic state machine driven by engine events.
///
/// State is rebuilt by replaying the run history through these callbacks,
/// so they must be deterministic: given the same event sequence they
/// produce the same state. All side effects happen in activities.
///
/// Steps with externally visible side effects register a compensating
/// step (`WorkflowAction::RegisterCompensation`) before acting on the
/// result; on failure the engine executes registered compensations in
/// reverse order.
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier, used by the registry during replay
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + Clone;
    type Output: Serialize + DeserializeOwned + Send;

    /// Create an instance from input. Called for new starts and replays.
    fn new(input: Self::Input) -> Self;

    /// Called when the workflow starts (and at the start of replay).
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully.
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails for good (retries exhausted or a
    /// non-retryable kind).
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a durable timer fires.
    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = timer_id;
        vec![]
    }

    /// Called when an external signal arrives.
    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = signal;
        vec![]
    }

    /// Called when the wall-clock workflow timeout elapses. The default
    /// fails the workflow, which enters the compensation path; override to
    /// catch and retry instead.
    fn on_timeout(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::timed_out())]
    }

    /// Whether the workflow has reached a terminal state.
    fn is_completed(&self) -> bool;

    /// The result, if completed successfully.
    fn result(&self) -> Option<Self::Output>;

    /// The error, if failed.
    fn error(&self) -> Option<WorkflowError> {
        None
    }
}
