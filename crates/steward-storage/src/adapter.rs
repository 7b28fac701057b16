//! Storage trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use steward_core::{
    AuditRecord, EffectRecord, EffectStatus, EngineError, ExecutionInstance, ExecutionStatus,
    PlaybookDefinition, StatusChange, StepInstance, Task, TaskPriority, TaskState, Timer,
};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Entity not found (or belongs to a different organization)
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic-lock failure on a conditional write
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// A timer claim no longer belongs to the caller (fired or reclaimed)
    #[error("timer claim lost: {timer_id}")]
    ClaimLost { timer_id: Uuid },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, id } => EngineError::NotFound { kind, id },
            StorageError::ClaimLost { timer_id } => EngineError::TimerClaimExpired { timer_id },
            other => EngineError::Storage(other.to_string()),
        }
    }
}

/// Sort key for instance listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstanceSortKey {
    #[default]
    StartedAt,
    LastActivityAt,
}

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter for listing execution instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub playbook_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub owner_team: Option<String>,
    /// Shorthand for `status == Paused`
    pub paused: Option<bool>,
    /// Instances with at least one overdue open task
    pub overdue: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort_by: InstanceSortKey,
    pub sort_order: SortOrder,
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub execution_id: Option<Uuid>,
    pub state: Option<TaskState>,
    pub assignee_role: Option<String>,
    pub assignee_user: Option<String>,
    pub priority: Option<TaskPriority>,
    pub overdue: Option<bool>,
}

/// Filter for listing effect records
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EffectFilter {
    pub step_id: Option<String>,
    pub status: Option<EffectStatus>,
    pub retryable: Option<bool>,
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Storage adapter for the playbook engine.
///
/// Implementations must be thread-safe and support concurrent access.
/// Every read is scoped by `organization_id`; an entity belonging to a
/// different organization is reported as [`StorageError::NotFound`].
///
/// The sweep-support methods (`claim_due_timers`, `due_timers`,
/// `stalled_instances`) are system-level and cross-organization; each
/// returned record carries its own `organization_id` for the follow-up
/// scoped calls.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Store a published definition. Fails if (org, code, version) exists.
    async fn put_definition(&self, definition: &PlaybookDefinition) -> Result<(), StorageError>;

    async fn get_definition(
        &self,
        organization_id: Uuid,
        code: &str,
        version: u32,
    ) -> Result<PlaybookDefinition, StorageError>;

    /// Highest-version definition with `active` status
    async fn latest_active_definition(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> Result<PlaybookDefinition, StorageError>;

    // =========================================================================
    // Execution instances
    // =========================================================================

    async fn insert_instance(&self, instance: &ExecutionInstance) -> Result<(), StorageError>;

    async fn get_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<ExecutionInstance, StorageError>;

    /// Conditional write: succeeds only when the stored `version` equals
    /// `expected_version`. The caller passes `instance` with `version`
    /// already bumped to `expected_version + 1`.
    async fn update_instance(
        &self,
        instance: &ExecutionInstance,
        expected_version: u64,
    ) -> Result<(), StorageError>;

    async fn list_instances(
        &self,
        organization_id: Uuid,
        filter: &InstanceFilter,
        page: &Page,
    ) -> Result<Vec<ExecutionInstance>, StorageError>;

    /// Most recent non-terminal instance with the same playbook, initiator,
    /// and structurally equal input, started at or after `started_after`.
    async fn find_duplicate_start(
        &self,
        organization_id: Uuid,
        playbook_id: &str,
        initiated_by: &str,
        input_data: &Value,
        started_after: DateTime<Utc>,
    ) -> Result<Option<ExecutionInstance>, StorageError>;

    /// `in_progress` instances with no activity since `stale_before`
    async fn stalled_instances(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExecutionInstance>, StorageError>;

    // =========================================================================
    // Step instances
    // =========================================================================

    async fn insert_step_instance(&self, step: &StepInstance) -> Result<(), StorageError>;

    async fn update_step_instance(&self, step: &StepInstance) -> Result<(), StorageError>;

    async fn get_step_instance(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<StepInstance, StorageError>;

    /// The `active` step instance for (execution, step), if any
    async fn active_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepInstance>, StorageError>;

    /// The most recently started step instance for (execution, step)
    async fn latest_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepInstance>, StorageError>;

    async fn list_step_instances(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StepInstance>, StorageError>;

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError>;

    async fn update_task(&self, task: &Task) -> Result<(), StorageError>;

    async fn get_task(&self, organization_id: Uuid, task_id: Uuid) -> Result<Task, StorageError>;

    /// The open (open/in_progress) task for (execution, step), if any
    async fn open_task_for_step(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<Task>, StorageError>;

    async fn list_tasks(
        &self,
        organization_id: Uuid,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>, StorageError>;

    // =========================================================================
    // Timers
    // =========================================================================

    async fn insert_timer(&self, timer: &Timer) -> Result<(), StorageError>;

    async fn get_timer(&self, organization_id: Uuid, timer_id: Uuid)
        -> Result<Timer, StorageError>;

    /// Read-only view of due, claimable timers (dry-run support)
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Timer>, StorageError>;

    /// Atomically claim due timers for `worker_id`.
    ///
    /// Only timers with `fired = false` and no live claim (unclaimed, or a
    /// claim older than `lease`) are claimed; two workers can never hold
    /// the same timer at once.
    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<Timer>, StorageError>;

    /// Mark a claimed timer fired (false -> true exactly once).
    ///
    /// Fails with [`StorageError::ClaimLost`] when the timer is already
    /// fired or claimed by a different worker.
    async fn mark_timer_fired(&self, timer_id: Uuid, worker_id: &str) -> Result<(), StorageError>;

    /// Release a claim without firing (processing failed; another worker
    /// may retry after re-claim)
    async fn release_timer_claim(
        &self,
        timer_id: Uuid,
        worker_id: &str,
    ) -> Result<(), StorageError>;

    /// Unfired timers owned by an execution
    async fn pending_timers_for_execution(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<Timer>, StorageError>;

    /// Move an unfired timer's deadline
    async fn reschedule_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Drop an unfired timer (e.g. an SLA timer whose task completed)
    async fn cancel_timer(&self, organization_id: Uuid, timer_id: Uuid)
        -> Result<(), StorageError>;

    // =========================================================================
    // Effect records
    // =========================================================================

    async fn append_effect(&self, effect: &EffectRecord) -> Result<(), StorageError>;

    /// Settle a pending effect record in place (the attempt's own row; new
    /// attempts are appended, never rewritten)
    async fn update_effect(&self, effect: &EffectRecord) -> Result<(), StorageError>;

    async fn list_effects(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        filter: &EffectFilter,
    ) -> Result<Vec<EffectRecord>, StorageError>;

    // =========================================================================
    // Status history and audit
    // =========================================================================

    async fn append_status_change(&self, change: &StatusChange) -> Result<(), StorageError>;

    async fn status_history(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StatusChange>, StorageError>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError>;

    async fn audit_trail(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<AuditRecord>, StorageError>;
}
