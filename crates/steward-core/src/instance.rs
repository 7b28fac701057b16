//! Execution instances and step instances
//!
//! The instance status is a typed enum with an explicit transition table,
//! paired with an append-only [`StatusChange`] history so invariants are
//! checkable in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle status of an execution instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are final; no further mutation is permitted
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The state-machine transition table
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, InProgress) | (Pending, Cancelled) | (Pending, Failed) => true,
            (InProgress, Paused)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled) => true,
            (Paused, InProgress) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One running (or finished) occurrence of a playbook.
///
/// Mutated only by the execution engine under version-checked updates:
/// read `version`, compute the new state, write conditionally on `version`
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    pub execution_id: Uuid,
    pub organization_id: Uuid,
    pub playbook_id: String,
    pub playbook_version: u32,

    /// Optimistic-lock counter, bumped on every conditional write
    pub version: u64,

    pub status: ExecutionStatus,
    pub current_step_id: Option<String>,

    pub input_data: Value,

    /// Accumulated step outputs, keyed by step id
    pub context: Map<String, Value>,

    pub output_data: Option<Value>,
    pub error: Option<String>,

    /// Cooperative cancellation: set while an automated attempt is in
    /// flight, honored at the next safe checkpoint
    pub cancel_requested: bool,

    pub initiated_by: String,
    pub owner_team: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Drives staleness detection in the scheduler sweep
    pub last_activity_at: DateTime<Utc>,
}

impl ExecutionInstance {
    pub fn new(
        organization_id: Uuid,
        playbook_id: impl Into<String>,
        playbook_version: u32,
        input_data: Value,
        initiated_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            organization_id,
            playbook_id: playbook_id.into(),
            playbook_version,
            version: 0,
            status: ExecutionStatus::Pending,
            current_step_id: None,
            input_data,
            context: Map::new(),
            output_data: None,
            error: None,
            cancel_requested: false,
            initiated_by: initiated_by.into(),
            owner_team: None,
            started_at: now,
            completed_at: None,
            last_activity_at: now,
        }
    }

    /// The context as a JSON value, for predicate evaluation
    pub fn context_value(&self) -> Value {
        Value::Object(self.context.clone())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }
}

/// Lifecycle status of one step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// One execution attempt of a step.
///
/// Invariant: at most one step instance per (execution, step) is `active`
/// at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepInstance {
    pub fn activate(
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id,
            execution_id,
            step_id: step_id.into(),
            status: StepStatus::Active,
            attempt_count: 1,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Append-only record of an execution status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub from: Option<ExecutionStatus>,
    pub to: ExecutionStatus,
    pub reason: Option<String>,
    pub changed_by: String,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn record(
        instance: &ExecutionInstance,
        from: Option<ExecutionStatus>,
        to: ExecutionStatus,
        reason: Option<String>,
        changed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id: instance.organization_id,
            execution_id: instance.execution_id,
            from,
            to,
            reason,
            changed_by: changed_by.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states_admit_no_transition() {
        use ExecutionStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, InProgress, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_pause_only_from_in_progress() {
        use ExecutionStatus::*;
        assert!(InProgress.can_transition_to(Paused));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Paused));
    }

    #[test]
    fn test_resume_only_from_paused() {
        use ExecutionStatus::*;
        assert!(Paused.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(InProgress));
    }

    #[test]
    fn test_any_non_terminal_can_cancel() {
        use ExecutionStatus::*;
        for state in [Pending, InProgress, Paused] {
            assert!(state.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        use std::str::FromStr;
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::InProgress,
            ExecutionStatus::Paused,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(
                ExecutionStatus::from_str(&status.to_string()),
                Ok(status)
            );
        }
    }

    #[test]
    fn test_context_value() {
        let mut instance = ExecutionInstance::new(
            Uuid::now_v7(),
            "onboarding",
            1,
            json!({}),
            "alex@example.com",
        );
        instance
            .context
            .insert("verify".to_string(), json!({"verdict": "approved"}));

        assert_eq!(
            instance.context_value(),
            json!({"verify": {"verdict": "approved"}})
        );
    }
}
