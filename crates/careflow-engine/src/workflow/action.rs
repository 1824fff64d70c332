//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use careflow_core::config::ActivityDefaults;

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Commands a workflow issues in response to events.
///
/// Each action is persisted as a [`RunEvent`](super::RunEvent) before
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution on the workflow's task queue
    ScheduleActivity {
        /// Unique identifier within the workflow
        activity_id: String,

        /// Registry key of the activity to run
        activity_type: String,

        input: serde_json::Value,

        options: ActivityOptions,
    },

    /// Register a compensating step for the side effect the workflow is
    /// about to rely on. Compensations run in reverse registration order
    /// when the workflow fails or is cancelled.
    RegisterCompensation {
        /// Unique identifier within the workflow
        compensation_id: String,

        activity_type: String,

        input: serde_json::Value,

        options: ActivityOptions,
    },

    /// Start a durable timer
    StartTimer {
        timer_id: String,

        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Complete the workflow with a result
    CompleteWorkflow { result: serde_json::Value },

    /// Fail the workflow; enters the compensation path when compensations
    /// are registered and the error kind warrants it
    FailWorkflow { error: WorkflowError },

    /// No action
    None,
}

impl WorkflowAction {
    /// Schedule an activity with default options.
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Schedule an activity with explicit options.
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Register a compensation with default options.
    pub fn compensation(
        compensation_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::RegisterCompensation {
            compensation_id: compensation_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }
}

/// Options for activity execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    pub retry_policy: RetryPolicy,

    /// Maximum execution time per attempt
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    /// Build from the configured defaults.
    pub fn from_defaults(defaults: &ActivityDefaults) -> Self {
        Self {
            retry_policy: RetryPolicy::from_defaults(defaults),
            start_to_close_timeout: defaults.start_to_close,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_helper() {
        let action = WorkflowAction::schedule_activity("step-1", "create_organization", json!({}));
        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "create_organization");
            }
            other => panic!("expected ScheduleActivity, got {other:?}"),
        }
    }

    #[test]
    fn test_compensation_helper() {
        let action =
            WorkflowAction::compensation("comp-org", "deactivate_organization", json!({}));
        assert!(matches!(
            action,
            WorkflowAction::RegisterCompensation { .. }
        ));
    }

    #[test]
    fn test_action_serialization() {
        let action = WorkflowAction::timer("delay", Duration::from_secs(60));
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"start_timer\""));

        let parsed: WorkflowAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, parsed);
    }

    #[test]
    fn test_options_from_defaults() {
        let defaults = ActivityDefaults::default();
        let options = ActivityOptions::from_defaults(&defaults);
        assert_eq!(options.retry_policy.max_attempts, 3);
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(300));
    }
}
