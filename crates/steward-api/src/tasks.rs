//! Task HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use steward_core::{Task, TaskPriority, TaskState};
use steward_engine::{CompleteTaskRequest, ReassignTaskRequest};
use steward_storage::{Page, Storage, TaskFilter};

use crate::common::{assignee_from_parts, ApiError, AppState, ListResponse};

/// Query parameters for listing tasks
#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    pub organization_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub task_state: Option<TaskState>,
    pub assignee_role: Option<String>,
    pub assignee_user_id: Option<String>,
    pub priority: Option<TaskPriority>,
    pub overdue: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

/// Reassign a task; exactly one of `assignee_role` or `assignee_user_id`
/// must be set
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReassignTaskBody {
    pub organization_id: Uuid,
    #[serde(default)]
    pub assignee_role: Option<String>,
    #[serde(default)]
    pub assignee_user_id: Option<String>,
    pub reassigned_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteTaskBody {
    pub organization_id: Uuid,
    pub completed_by: String,
}

/// Create task routes
pub fn routes<S: Storage>(state: AppState<S>) -> Router {
    Router::new()
        .route("/v1/tasks", get(list_tasks::<S>))
        .route("/v1/tasks/:task_id/reassign", post(reassign_task::<S>))
        .route("/v1/tasks/:task_id/complete", post(complete_task::<S>))
        .with_state(state)
}

/// GET /v1/tasks - list tasks
pub async fn list_tasks<S: Storage>(
    State(state): State<AppState<S>>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ListResponse<Task>>, ApiError> {
    let filter = TaskFilter {
        execution_id: params.instance_id,
        state: params.task_state,
        assignee_role: params.assignee_role,
        assignee_user: params.assignee_user_id,
        priority: params.priority,
        overdue: params.overdue,
    };
    let page = Page {
        offset: params.offset,
        limit: params.limit,
    };

    let tasks = state
        .engine
        .tasks()
        .list(params.organization_id, &filter, &page)
        .await?;

    Ok(Json(tasks.into()))
}

/// POST /v1/tasks/{task_id}/reassign
pub async fn reassign_task<S: Storage>(
    State(state): State<AppState<S>>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<ReassignTaskBody>,
) -> Result<StatusCode, ApiError> {
    let new_assignee = assignee_from_parts(body.assignee_role, body.assignee_user_id)?;

    state
        .engine
        .reassign_task(ReassignTaskRequest {
            organization_id: body.organization_id,
            task_id,
            new_assignee,
            reassigned_by: body.reassigned_by,
            reason: body.reason,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/tasks/{task_id}/complete
pub async fn complete_task<S: Storage>(
    State(state): State<AppState<S>>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<CompleteTaskBody>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .complete_task(CompleteTaskRequest {
            organization_id: body.organization_id,
            task_id,
            completed_by: body.completed_by,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
