//! Effect records: append-only audit of automated-step attempts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one action invocation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for EffectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown effect status: {other}")),
        }
    }
}

/// One recorded attempt to execute an automated step's external action.
///
/// Records are appended per attempt and never rewritten once settled; the
/// retry-effects operation appends fresh attempts rather than mutating
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub step_instance_id: Uuid,
    pub step_id: String,

    /// 1-based attempt number within the step instance
    pub attempt: u32,

    /// Action adapter label that was (or will be) invoked
    pub action: String,

    pub status: EffectStatus,
    pub error: Option<String>,
    pub retryable: bool,

    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl EffectRecord {
    /// A freshly scheduled attempt, not yet executed
    pub fn pending(
        organization_id: Uuid,
        execution_id: Uuid,
        step_instance_id: Uuid,
        step_id: impl Into<String>,
        attempt: u32,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id,
            execution_id,
            step_instance_id,
            step_id: step_id.into(),
            attempt,
            action: action.into(),
            status: EffectStatus::Pending,
            error: None,
            retryable: false,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    pub fn settle_success(&mut self) {
        self.status = EffectStatus::Succeeded;
        self.settled_at = Some(Utc::now());
    }

    pub fn settle_failure(&mut self, error: impl Into<String>, retryable: bool) {
        self.status = EffectStatus::Failed;
        self.error = Some(error.into());
        self.retryable = retryable;
        self.settled_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_failure_records_retryability() {
        let mut effect = EffectRecord::pending(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "notify",
            1,
            "email.send",
        );
        assert_eq!(effect.status, EffectStatus::Pending);

        effect.settle_failure("connection reset", true);
        assert_eq!(effect.status, EffectStatus::Failed);
        assert!(effect.retryable);
        assert!(effect.settled_at.is_some());
    }
}
