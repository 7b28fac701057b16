//! Task manager: human work items
//!
//! Creation, reassignment (full replace, audit-logged), completion, and
//! filtered listing. Step-lifecycle consequences of task completion live
//! in the execution engine, which calls back into `advance`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use steward_core::{Assignee, AuditKind, AuditRecord, EngineError, Task, TaskState};
use steward_storage::{Page, Storage, TaskFilter};

/// Manages tasks generated by task-type steps
pub struct TaskManager<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> TaskManager<S> {
    pub(crate) fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub(crate) async fn create(&self, task: Task) -> Result<Task, EngineError> {
        self.storage.insert_task(&task).await?;
        debug!(task_id = %task.task_id, step_id = %task.step_id, "task created");
        Ok(task)
    }

    pub async fn get(&self, organization_id: Uuid, task_id: Uuid) -> Result<Task, EngineError> {
        Ok(self.storage.get_task(organization_id, task_id).await?)
    }

    pub async fn list(
        &self,
        organization_id: Uuid,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>, EngineError> {
        Ok(self.storage.list_tasks(organization_id, filter, page).await?)
    }

    /// Full replace of the assignee, with exactly one audit record.
    pub(crate) async fn reassign(
        &self,
        organization_id: Uuid,
        task_id: Uuid,
        new_assignee: Assignee,
        reassigned_by: &str,
        reason: Option<String>,
        kind: AuditKind,
    ) -> Result<Task, EngineError> {
        let mut task = self.storage.get_task(organization_id, task_id).await?;

        if !task.state.is_open() {
            return Err(EngineError::invalid_transition("reassign task", task.state));
        }

        let old_assignee = task.assignee.clone();
        task.assignee = new_assignee;
        self.storage.update_task(&task).await?;

        let audit = AuditRecord::new(organization_id, task.execution_id, kind, reassigned_by)
            .with_detail(format!("{old_assignee} -> {}", task.assignee))
            .with_reason(reason);
        self.storage.append_audit(&audit).await?;

        info!(%task_id, assignee = %task.assignee, "task reassigned");
        Ok(task)
    }

    /// Mark an open task done. The engine drives the owning step from here.
    pub(crate) async fn complete(
        &self,
        organization_id: Uuid,
        task_id: Uuid,
        completed_by: &str,
    ) -> Result<Task, EngineError> {
        let mut task = self.storage.get_task(organization_id, task_id).await?;

        if !task.state.is_open() {
            return Err(EngineError::invalid_transition("complete task", task.state));
        }

        task.state = TaskState::Done;
        task.completed_at = Some(Utc::now());
        self.storage.update_task(&task).await?;

        info!(%task_id, completed_by, "task completed");
        Ok(task)
    }

    /// Cancel every open task of an execution (terminal instance cleanup)
    pub(crate) async fn cancel_open_for_execution(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let open = self
            .storage
            .list_tasks(
                organization_id,
                &TaskFilter {
                    execution_id: Some(execution_id),
                    ..Default::default()
                },
                &Page {
                    offset: 0,
                    limit: u32::MAX,
                },
            )
            .await?;

        for mut task in open {
            if task.state.is_open() {
                task.state = TaskState::Cancelled;
                self.storage.update_task(&task).await?;
            }
        }
        Ok(())
    }
}
