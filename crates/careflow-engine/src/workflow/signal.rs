//! External workflow signals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A signal delivered to a suspended workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    pub signal_type: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    pub fn new(signal_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_roundtrip() {
        let signal = WorkflowSignal::new("invitation.accepted", json!({"user": "u1"}));
        let json = serde_json::to_string(&signal).unwrap();
        let parsed: WorkflowSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(signal, parsed);
    }
}
