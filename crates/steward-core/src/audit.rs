//! Append-only audit records for reassignments and SLA recalculations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of audited operation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SlaRecalculated,
    TaskReassigned,
    ExecutionReassigned,
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlaRecalculated => write!(f, "sla_recalculated"),
            Self::TaskReassigned => write!(f, "task_reassigned"),
            Self::ExecutionReassigned => write!(f, "execution_reassigned"),
        }
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sla_recalculated" => Ok(Self::SlaRecalculated),
            "task_reassigned" => Ok(Self::TaskReassigned),
            "execution_reassigned" => Ok(Self::ExecutionReassigned),
            other => Err(format!("unknown audit kind: {other}")),
        }
    }
}

/// One audited operation on an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub kind: AuditKind,
    pub old_due_at: Option<DateTime<Utc>>,
    pub new_due_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub reason: Option<String>,
    pub performed_by: String,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        organization_id: Uuid,
        execution_id: Uuid,
        kind: AuditKind,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id,
            execution_id,
            kind,
            old_due_at: None,
            new_due_at: None,
            detail: None,
            reason: None,
            performed_by: performed_by.into(),
            at: Utc::now(),
        }
    }

    pub fn with_due_change(
        mut self,
        old_due_at: Option<DateTime<Utc>>,
        new_due_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.old_due_at = old_due_at;
        self.new_due_at = new_due_at;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}
