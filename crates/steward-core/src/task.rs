//! Human work items generated by task steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task assignee: a role or a specific user, never both.
///
/// The XOR invariant from the data model is the type itself; reassignment
/// is a full replace of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Assignee {
    Role(String),
    User(String),
}

impl Assignee {
    pub fn role(name: impl Into<String>) -> Self {
        Self::Role(name.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Role(_) => "role",
            Self::User(_) => "user",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Role(id) | Self::User(id) => id,
        }
    }
}

impl std::fmt::Display for Assignee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Open,
    InProgress,
    Done,
    Cancelled,
}

impl TaskState {
    /// States in which the task still awaits completion
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown task priority: {other}")),
        }
    }
}

/// A unit of human work, assignable and reassignable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub assignee: Assignee,
    pub state: TaskState,
    pub due_at: Option<DateTime<Utc>>,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn open(
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: impl Into<String>,
        assignee: Assignee,
        due_at: Option<DateTime<Utc>>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            organization_id,
            execution_id,
            step_id: step_id.into(),
            assignee,
            state: TaskState::Open,
            due_at,
            priority,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state.is_open() && self.due_at.is_some_and(|due| due < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_assignee_serialization() {
        let assignee = Assignee::role("fulfilment");
        let json = serde_json::to_string(&assignee).unwrap();
        assert_eq!(json, r#"{"kind":"role","id":"fulfilment"}"#);

        let parsed: Assignee = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, assignee);
    }

    #[test]
    fn test_overdue_requires_open_state() {
        let mut task = Task::open(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "review",
            Assignee::role("ops"),
            Some(Utc::now() - Duration::hours(1)),
            TaskPriority::Normal,
        );
        let now = Utc::now();
        assert!(task.is_overdue(now));

        task.state = TaskState::Done;
        assert!(!task.is_overdue(now));
    }

    #[test]
    fn test_no_due_date_is_never_overdue() {
        let task = Task::open(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "review",
            Assignee::user("u-7"),
            None,
            TaskPriority::High,
        );
        assert!(!task.is_overdue(Utc::now()));
    }
}
