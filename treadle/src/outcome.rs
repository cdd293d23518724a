//! The per-node execution result: created by a handler, consumed by the engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution status of a single node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Fail,
    PartialSuccess,
    Retry,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Fail => "fail",
            Status::PartialSuccess => "partial_success",
            Status::Retry => "retry",
            Status::Skipped => "skipped",
        }
    }

    /// Success-like for the purposes of goal gates: success or partial_success.
    pub fn satisfies_goal_gate(&self) -> bool {
        matches!(self, Status::Success | Status::PartialSuccess)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing one node.
#[derive(Clone, Debug, Default)]
pub struct Outcome {
    pub status: Option<Status>,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: HashMap<String, Value>,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            status: Some(Status::Success),
            ..Default::default()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Fail),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn partial_success(reason: impl Into<String>) -> Self {
        Self {
            status: Some(Status::PartialSuccess),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::Success)
    }

    pub fn with_context_update(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context_updates.insert(key.into(), value.into());
        self
    }

    pub fn with_preferred_label(mut self, label: impl Into<String>) -> Self {
        self.preferred_label = Some(label.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn is_fail(&self) -> bool {
        self.status() == Status::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: an Outcome with no status set defaults to success for status().
    #[test]
    fn missing_status_defaults_to_success() {
        let outcome = Outcome::default();
        assert_eq!(outcome.status(), Status::Success);
        assert!(!outcome.is_fail());
    }

    /// **Scenario**: partial_success satisfies a goal gate, fail does not.
    #[test]
    fn goal_gate_satisfaction() {
        assert!(Status::Success.satisfies_goal_gate());
        assert!(Status::PartialSuccess.satisfies_goal_gate());
        assert!(!Status::Fail.satisfies_goal_gate());
        assert!(!Status::Retry.satisfies_goal_gate());
    }
}
