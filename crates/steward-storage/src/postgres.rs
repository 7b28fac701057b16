//! PostgreSQL implementation of the storage adapter
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via the instance `version` column
//! - Atomic timer claiming with SKIP LOCKED
//! - Append-only effect, status-history, and audit tables

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use steward_core::{
    Assignee, AuditKind, AuditRecord, EffectRecord, EffectStatus, ExecutionInstance,
    ExecutionStatus, PlaybookDefinition, StatusChange, StepInstance, StepStatus, Task,
    TaskPriority, TaskState, Timer, TimerPurpose,
};

use super::adapter::*;

/// PostgreSQL implementation of [`Storage`].
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use steward_storage::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/steward").await?;
/// let storage = PostgresStorage::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> Result<T, StorageError> {
    T::from_str(raw).map_err(StorageError::Serialization)
}

fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now - chrono::Duration::milliseconds(lease.as_millis() as i64)
}

fn instance_from_row(row: &PgRow) -> Result<ExecutionInstance, StorageError> {
    let status: String = row.get("status");
    let context: Value = row.get("context");
    Ok(ExecutionInstance {
        execution_id: row.get("execution_id"),
        organization_id: row.get("organization_id"),
        playbook_id: row.get("playbook_id"),
        playbook_version: row.get::<i32, _>("playbook_version") as u32,
        version: row.get::<i64, _>("version") as u64,
        status: parse::<ExecutionStatus>(&status)?,
        current_step_id: row.get("current_step_id"),
        input_data: row.get("input_data"),
        context: context.as_object().cloned().unwrap_or_default(),
        output_data: row.get("output_data"),
        error: row.get("error"),
        cancel_requested: row.get("cancel_requested"),
        initiated_by: row.get("initiated_by"),
        owner_team: row.get("owner_team"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        last_activity_at: row.get("last_activity_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepInstance, StorageError> {
    let status: String = row.get("status");
    Ok(StepInstance {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        execution_id: row.get("execution_id"),
        step_id: row.get("step_id"),
        status: parse::<StepStatus>(&status)?,
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, StorageError> {
    let state: String = row.get("state");
    let priority: String = row.get("priority");
    let assignee_kind: String = row.get("assignee_kind");
    let assignee_id: String = row.get("assignee_id");
    let assignee = match assignee_kind.as_str() {
        "role" => Assignee::Role(assignee_id),
        "user" => Assignee::User(assignee_id),
        other => {
            return Err(StorageError::Serialization(format!(
                "unknown assignee kind: {other}"
            )))
        }
    };
    Ok(Task {
        task_id: row.get("task_id"),
        organization_id: row.get("organization_id"),
        execution_id: row.get("execution_id"),
        step_id: row.get("step_id"),
        assignee,
        state: parse::<TaskState>(&state)?,
        due_at: row.get("due_at"),
        priority: parse::<TaskPriority>(&priority)?,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn timer_from_row(row: &PgRow) -> Result<Timer, StorageError> {
    let purpose: String = row.get("purpose");
    Ok(Timer {
        timer_id: row.get("timer_id"),
        organization_id: row.get("organization_id"),
        execution_id: row.get("execution_id"),
        step_instance_id: row.get("step_instance_id"),
        purpose: parse::<TimerPurpose>(&purpose)?,
        fire_at: row.get("fire_at"),
        fired: row.get("fired"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
    })
}

fn effect_from_row(row: &PgRow) -> Result<EffectRecord, StorageError> {
    let status: String = row.get("status");
    Ok(EffectRecord {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        execution_id: row.get("execution_id"),
        step_instance_id: row.get("step_instance_id"),
        step_id: row.get("step_id"),
        attempt: row.get::<i32, _>("attempt") as u32,
        action: row.get("action"),
        status: parse::<EffectStatus>(&status)?,
        error: row.get("error"),
        retryable: row.get("retryable"),
        created_at: row.get("created_at"),
        settled_at: row.get("settled_at"),
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    #[instrument(skip(self, definition), fields(code = %definition.id, version = definition.version))]
    async fn put_definition(&self, definition: &PlaybookDefinition) -> Result<(), StorageError> {
        let body = serde_json::to_value(definition)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO playbook_definitions (organization_id, code, version, status, definition)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (organization_id, code, version) DO NOTHING
            "#,
        )
        .bind(definition.organization_id)
        .bind(&definition.id)
        .bind(definition.version as i32)
        .bind(definition.status.to_string())
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Database(format!(
                "definition {} v{} already published",
                definition.id, definition.version
            )));
        }

        debug!("stored definition");
        Ok(())
    }

    async fn get_definition(
        &self,
        organization_id: Uuid,
        code: &str,
        version: u32,
    ) -> Result<PlaybookDefinition, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT definition FROM playbook_definitions
            WHERE organization_id = $1 AND code = $2 AND version = $3
            "#,
        )
        .bind(organization_id)
        .bind(code)
        .bind(version as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::not_found("definition", format!("{code} v{version}")))?;

        let body: Value = row.get("definition");
        serde_json::from_value(body).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn latest_active_definition(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> Result<PlaybookDefinition, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT definition FROM playbook_definitions
            WHERE organization_id = $1 AND code = $2 AND status = 'active'
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::not_found("definition", code))?;

        let body: Value = row.get("definition");
        serde_json::from_value(body).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    #[instrument(skip(self, instance), fields(execution_id = %instance.execution_id))]
    async fn insert_instance(&self, instance: &ExecutionInstance) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id, organization_id, playbook_id, playbook_version, version,
                status, current_step_id, input_data, context, output_data, error,
                cancel_requested, initiated_by, owner_team, started_at, completed_at,
                last_activity_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(instance.execution_id)
        .bind(instance.organization_id)
        .bind(&instance.playbook_id)
        .bind(instance.playbook_version as i32)
        .bind(instance.version as i64)
        .bind(instance.status.to_string())
        .bind(&instance.current_step_id)
        .bind(&instance.input_data)
        .bind(Value::Object(instance.context.clone()))
        .bind(&instance.output_data)
        .bind(&instance.error)
        .bind(instance.cancel_requested)
        .bind(&instance.initiated_by)
        .bind(&instance.owner_team)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(instance.last_activity_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("created execution");
        Ok(())
    }

    async fn get_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<ExecutionInstance, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE organization_id = $1 AND execution_id = $2
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::not_found("execution", execution_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self, instance), fields(execution_id = %instance.execution_id, expected_version))]
    async fn update_instance(
        &self,
        instance: &ExecutionInstance,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE executions SET
                version = $3, status = $4, current_step_id = $5, context = $6,
                output_data = $7, error = $8, cancel_requested = $9, owner_team = $10,
                completed_at = $11, last_activity_at = $12
            WHERE organization_id = $1 AND execution_id = $2 AND version = $13
            "#,
        )
        .bind(instance.organization_id)
        .bind(instance.execution_id)
        .bind(instance.version as i64)
        .bind(instance.status.to_string())
        .bind(&instance.current_step_id)
        .bind(Value::Object(instance.context.clone()))
        .bind(&instance.output_data)
        .bind(&instance.error)
        .bind(instance.cancel_requested)
        .bind(&instance.owner_team)
        .bind(instance.completed_at)
        .bind(instance.last_activity_at)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Distinguish conflict from missing row
            let row = sqlx::query(
                r#"SELECT version FROM executions WHERE organization_id = $1 AND execution_id = $2"#,
            )
            .bind(instance.organization_id)
            .bind(instance.execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            return match row {
                Some(row) => Err(StorageError::VersionConflict {
                    expected: expected_version,
                    actual: row.get::<i64, _>("version") as u64,
                }),
                None => Err(StorageError::not_found("execution", instance.execution_id)),
            };
        }

        Ok(())
    }

    async fn list_instances(
        &self,
        organization_id: Uuid,
        filter: &InstanceFilter,
        page: &Page,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let status = match (filter.status, filter.paused) {
            (_, Some(true)) => Some(ExecutionStatus::Paused.to_string()),
            (Some(s), _) => Some(s.to_string()),
            (None, _) => None,
        };

        let sort_column = match filter.sort_by {
            InstanceSortKey::StartedAt => "started_at",
            InstanceSortKey::LastActivityAt => "last_activity_at",
        };
        let sort_order = match filter.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let query = format!(
            r#"
            SELECT * FROM executions e
            WHERE e.organization_id = $1
              AND ($2::text IS NULL OR e.playbook_id = $2)
              AND ($3::text IS NULL OR e.status = $3)
              AND ($4::text IS NULL OR e.owner_team = $4)
              AND ($5::timestamptz IS NULL OR e.started_at >= $5)
              AND ($6::timestamptz IS NULL OR e.started_at <= $6)
              AND ($7::boolean IS NULL OR $7 = EXISTS (
                    SELECT 1 FROM tasks t
                    WHERE t.execution_id = e.execution_id
                      AND t.state IN ('open', 'in_progress')
                      AND t.due_at IS NOT NULL AND t.due_at < NOW()
              ))
            ORDER BY e.{sort_column} {sort_order}
            OFFSET $8 LIMIT $9
            "#
        );

        let rows = sqlx::query(&query)
            .bind(organization_id)
            .bind(&filter.playbook_id)
            .bind(status)
            .bind(&filter.owner_team)
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.overdue)
            .bind(page.offset as i64)
            .bind(page.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn find_duplicate_start(
        &self,
        organization_id: Uuid,
        playbook_id: &str,
        initiated_by: &str,
        input_data: &Value,
        started_after: DateTime<Utc>,
    ) -> Result<Option<ExecutionInstance>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE organization_id = $1
              AND playbook_id = $2
              AND initiated_by = $3
              AND input_data = $4
              AND status IN ('pending', 'in_progress', 'paused')
              AND started_at >= $5
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(playbook_id)
        .bind(initiated_by)
        .bind(input_data)
        .bind(started_after)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn stalled_instances(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE status = 'in_progress' AND last_activity_at < $1
            ORDER BY last_activity_at
            LIMIT $2
            "#,
        )
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn insert_step_instance(&self, step: &StepInstance) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO step_instances (
                id, organization_id, execution_id, step_id, status, attempt_count,
                output, error, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(step.id)
        .bind(step.organization_id)
        .bind(step.execution_id)
        .bind(&step.step_id)
        .bind(step.status.to_string())
        .bind(step.attempt_count as i32)
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_step_instance(&self, step: &StepInstance) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE step_instances SET
                status = $3, attempt_count = $4, output = $5, error = $6, completed_at = $7
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(step.organization_id)
        .bind(step.id)
        .bind(step.status.to_string())
        .bind(step.attempt_count as i32)
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("step instance", step.id));
        }
        Ok(())
    }

    async fn get_step_instance(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<StepInstance, StorageError> {
        let row = sqlx::query(
            r#"SELECT * FROM step_instances WHERE organization_id = $1 AND id = $2"#,
        )
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::not_found("step instance", id))?;

        step_from_row(&row)
    }

    async fn active_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepInstance>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM step_instances
            WHERE organization_id = $1 AND execution_id = $2 AND step_id = $3
              AND status = 'active'
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn latest_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepInstance>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM step_instances
            WHERE organization_id = $1 AND execution_id = $2 AND step_id = $3
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_step_instances(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StepInstance>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM step_instances
            WHERE organization_id = $1 AND execution_id = $2
            ORDER BY started_at
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(step_from_row).collect()
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, organization_id, execution_id, step_id, assignee_kind,
                assignee_id, state, due_at, priority, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.task_id)
        .bind(task.organization_id)
        .bind(task.execution_id)
        .bind(&task.step_id)
        .bind(task.assignee.kind())
        .bind(task.assignee.id())
        .bind(task.state.to_string())
        .bind(task.due_at)
        .bind(task.priority.to_string())
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                assignee_kind = $3, assignee_id = $4, state = $5, due_at = $6,
                priority = $7, completed_at = $8
            WHERE organization_id = $1 AND task_id = $2
            "#,
        )
        .bind(task.organization_id)
        .bind(task.task_id)
        .bind(task.assignee.kind())
        .bind(task.assignee.id())
        .bind(task.state.to_string())
        .bind(task.due_at)
        .bind(task.priority.to_string())
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("task", task.task_id));
        }
        Ok(())
    }

    async fn get_task(&self, organization_id: Uuid, task_id: Uuid) -> Result<Task, StorageError> {
        let row = sqlx::query(r#"SELECT * FROM tasks WHERE organization_id = $1 AND task_id = $2"#)
            .bind(organization_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::not_found("task", task_id))?;

        task_from_row(&row)
    }

    async fn open_task_for_step(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<Task>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE organization_id = $1 AND execution_id = $2 AND step_id = $3
              AND state IN ('open', 'in_progress')
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(
        &self,
        organization_id: Uuid,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>, StorageError> {
        let state = filter.state.map(|s| s.to_string());
        let priority = filter.priority.map(|p| p.to_string());

        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE organization_id = $1
              AND ($2::uuid IS NULL OR execution_id = $2)
              AND ($3::text IS NULL OR state = $3)
              AND ($4::text IS NULL OR (assignee_kind = 'role' AND assignee_id = $4))
              AND ($5::text IS NULL OR (assignee_kind = 'user' AND assignee_id = $5))
              AND ($6::text IS NULL OR priority = $6)
              AND ($7::boolean IS NULL OR $7 = (
                    state IN ('open', 'in_progress')
                    AND due_at IS NOT NULL AND due_at < NOW()
              ))
            ORDER BY created_at
            OFFSET $8 LIMIT $9
            "#,
        )
        .bind(organization_id)
        .bind(filter.execution_id)
        .bind(state)
        .bind(&filter.assignee_role)
        .bind(&filter.assignee_user)
        .bind(priority)
        .bind(filter.overdue)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn insert_timer(&self, timer: &Timer) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO timers (
                timer_id, organization_id, execution_id, step_instance_id, purpose,
                fire_at, fired, claimed_by, claimed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(timer.timer_id)
        .bind(timer.organization_id)
        .bind(timer.execution_id)
        .bind(timer.step_instance_id)
        .bind(timer.purpose.to_string())
        .bind(timer.fire_at)
        .bind(timer.fired)
        .bind(&timer.claimed_by)
        .bind(timer.claimed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
    ) -> Result<Timer, StorageError> {
        let row =
            sqlx::query(r#"SELECT * FROM timers WHERE organization_id = $1 AND timer_id = $2"#)
                .bind(organization_id)
                .bind(timer_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or_else(|| StorageError::not_found("timer", timer_id))?;

        timer_from_row(&row)
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Timer>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM timers
            WHERE fired = FALSE AND fire_at <= $1
              AND (claimed_by IS NULL OR claimed_at <= $2)
            ORDER BY fire_at
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(lease_cutoff(now, lease))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(timer_from_row).collect()
    }

    #[instrument(skip(self), fields(worker_id))]
    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<Timer>, StorageError> {
        // Single conditional UPDATE: only unfired timers with no live claim
        // become claimed, so two workers never fire the same timer.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT timer_id FROM timers
                WHERE fired = FALSE AND fire_at <= $1
                  AND (claimed_by IS NULL OR claimed_at <= $2)
                ORDER BY fire_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE timers t
            SET claimed_by = $4, claimed_at = $1
            FROM due
            WHERE t.timer_id = due.timer_id
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(lease_cutoff(now, lease))
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(claimed = rows.len(), "claimed due timers");
        rows.iter().map(timer_from_row).collect()
    }

    async fn mark_timer_fired(&self, timer_id: Uuid, worker_id: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE timers SET fired = TRUE, claimed_by = NULL, claimed_at = NULL
            WHERE timer_id = $1 AND fired = FALSE AND claimed_by = $2
            "#,
        )
        .bind(timer_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            error!(%timer_id, worker_id, "timer claim lost before mark_fired");
            return Err(StorageError::ClaimLost { timer_id });
        }
        Ok(())
    }

    async fn release_timer_claim(
        &self,
        timer_id: Uuid,
        worker_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE timers SET claimed_by = NULL, claimed_at = NULL
            WHERE timer_id = $1 AND fired = FALSE AND claimed_by = $2
            "#,
        )
        .bind(timer_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn pending_timers_for_execution(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<Timer>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM timers
            WHERE organization_id = $1 AND execution_id = $2 AND fired = FALSE
            ORDER BY fire_at
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(timer_from_row).collect()
    }

    async fn reschedule_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE timers SET fire_at = $3
            WHERE organization_id = $1 AND timer_id = $2 AND fired = FALSE
            "#,
        )
        .bind(organization_id)
        .bind(timer_id)
        .bind(fire_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("timer", timer_id));
        }
        Ok(())
    }

    async fn cancel_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"DELETE FROM timers WHERE organization_id = $1 AND timer_id = $2 AND fired = FALSE"#,
        )
        .bind(organization_id)
        .bind(timer_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("timer", timer_id));
        }
        Ok(())
    }

    async fn append_effect(&self, effect: &EffectRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO effect_records (
                id, organization_id, execution_id, step_instance_id, step_id, attempt,
                action, status, error, retryable, created_at, settled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(effect.id)
        .bind(effect.organization_id)
        .bind(effect.execution_id)
        .bind(effect.step_instance_id)
        .bind(&effect.step_id)
        .bind(effect.attempt as i32)
        .bind(&effect.action)
        .bind(effect.status.to_string())
        .bind(&effect.error)
        .bind(effect.retryable)
        .bind(effect.created_at)
        .bind(effect.settled_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_effect(&self, effect: &EffectRecord) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE effect_records SET status = $3, error = $4, retryable = $5, settled_at = $6
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(effect.organization_id)
        .bind(effect.id)
        .bind(effect.status.to_string())
        .bind(&effect.error)
        .bind(effect.retryable)
        .bind(effect.settled_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("effect record", effect.id));
        }
        Ok(())
    }

    async fn list_effects(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        filter: &EffectFilter,
    ) -> Result<Vec<EffectRecord>, StorageError> {
        let status = filter.status.map(|s| s.to_string());

        let rows = sqlx::query(
            r#"
            SELECT * FROM effect_records
            WHERE organization_id = $1 AND execution_id = $2
              AND ($3::text IS NULL OR step_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::boolean IS NULL OR retryable = $5)
            ORDER BY created_at
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .bind(&filter.step_id)
        .bind(status)
        .bind(filter.retryable)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(effect_from_row).collect()
    }

    async fn append_status_change(&self, change: &StatusChange) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO status_changes (
                id, organization_id, execution_id, from_status, to_status, reason,
                changed_by, at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(change.id)
        .bind(change.organization_id)
        .bind(change.execution_id)
        .bind(change.from.map(|s| s.to_string()))
        .bind(change.to.to_string())
        .bind(&change.reason)
        .bind(&change.changed_by)
        .bind(change.at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn status_history(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StatusChange>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM status_changes
            WHERE organization_id = $1 AND execution_id = $2
            ORDER BY at
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let from: Option<String> = row.get("from_status");
                let to: String = row.get("to_status");
                Ok(StatusChange {
                    id: row.get("id"),
                    organization_id: row.get("organization_id"),
                    execution_id: row.get("execution_id"),
                    from: from.as_deref().map(parse::<ExecutionStatus>).transpose()?,
                    to: parse::<ExecutionStatus>(&to)?,
                    reason: row.get("reason"),
                    changed_by: row.get("changed_by"),
                    at: row.get("at"),
                })
            })
            .collect()
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (
                id, organization_id, execution_id, kind, old_due_at, new_due_at,
                detail, reason, performed_by, at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.organization_id)
        .bind(record.execution_id)
        .bind(record.kind.to_string())
        .bind(record.old_due_at)
        .bind(record.new_due_at)
        .bind(&record.detail)
        .bind(&record.reason)
        .bind(&record.performed_by)
        .bind(record.at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn audit_trail(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_records
            WHERE organization_id = $1 AND execution_id = $2
            ORDER BY at
            "#,
        )
        .bind(organization_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                Ok(AuditRecord {
                    id: row.get("id"),
                    organization_id: row.get("organization_id"),
                    execution_id: row.get("execution_id"),
                    kind: parse::<AuditKind>(&kind)?,
                    old_due_at: row.get("old_due_at"),
                    new_due_at: row.get("new_due_at"),
                    detail: row.get("detail"),
                    reason: row.get("reason"),
                    performed_by: row.get("performed_by"),
                    at: row.get("at"),
                })
            })
            .collect()
    }
}
