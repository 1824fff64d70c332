//! Engine run history events
//!
//! Each workflow run owns an append-only sequence of these events; replay
//! in sequence order rebuilds the workflow state after any interruption.
//! Distinct from the domain-event log: this history is engine plumbing,
//! the domain log is the business record.

use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Events stored in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Run started with the given input
    WorkflowStarted { input: serde_json::Value },

    /// Activity was scheduled and enqueued
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Activity completed successfully
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },

    /// Activity failed; `will_retry` distinguishes per-attempt failures
    /// from final ones
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        will_retry: bool,
    },

    /// Activity exceeded its start-to-close timeout
    ActivityTimedOut {
        activity_id: String,
        will_retry: bool,
    },

    /// Durable timer scheduled
    TimerStarted { timer_id: String, duration_ms: u64 },

    /// Timer elapsed
    TimerFired { timer_id: String },

    /// External signal delivered
    SignalReceived { signal: WorkflowSignal },

    /// Compensation registered for a completed side effect
    CompensationRegistered {
        compensation_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Compensation activity enqueued (Saga path underway)
    CompensationStarted { compensation_id: String },

    /// Compensation activity finished
    CompensationCompleted { compensation_id: String },

    /// Compensation activity failed; the chain continues regardless
    CompensationFailed {
        compensation_id: String,
        error: String,
    },

    /// Wall-clock workflow timeout elapsed
    WorkflowTimedOut,

    /// Terminal: completed with a result
    WorkflowCompleted { result: serde_json::Value },

    /// Terminal decision: failed (compensations may still run after this)
    WorkflowFailed { error: WorkflowError },

    /// Terminal decision: cancelled externally
    WorkflowCancelled { reason: String },
}

impl RunEvent {
    /// Stable name stored alongside the payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityTimedOut { .. } => "activity_timed_out",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::SignalReceived { .. } => "signal_received",
            Self::CompensationRegistered { .. } => "compensation_registered",
            Self::CompensationStarted { .. } => "compensation_started",
            Self::CompensationCompleted { .. } => "compensation_completed",
            Self::CompensationFailed { .. } => "compensation_failed",
            Self::WorkflowTimedOut => "workflow_timed_out",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }

    /// Whether this event ends the workflow's forward progress.
    pub fn is_terminal_decision(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}
