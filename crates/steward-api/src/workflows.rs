//! Workflow (execution) HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use steward_core::{EngineError, ExecutionStatus};
use steward_engine::{
    CancelRequest, DescribeOptions, ExecutionDetail, PauseRequest, ReassignRequest, ResumeRequest,
    RetryEffectsRequest, SlaRecalcRequest, StartReceipt, StartRequest,
};
use steward_storage::{EffectFilter, InstanceFilter, InstanceSortKey, Page, SortOrder, Storage};

use crate::common::{assignee_from_parts, ApiError, AppState, ListResponse};

/// Request to start a workflow execution
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartWorkflowBody {
    pub organization_id: Uuid,
    pub playbook_id: String,
    #[schema(value_type = Object)]
    pub input_data: Value,
    pub initiated_by: String,
    #[serde(default)]
    pub owner_team: Option<String>,
    #[serde(default)]
    pub skip_input_validation: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PauseBody {
    pub organization_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    pub paused_by: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResumeBody {
    pub organization_id: Uuid,
    pub resumed_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelBody {
    pub organization_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    pub cancelled_by: String,
}

/// Reassign the execution's current task step; exactly one of `owner_team`
/// or `owner_user_id` must be set
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReassignWorkflowBody {
    pub organization_id: Uuid,
    #[serde(default)]
    pub owner_team: Option<String>,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    pub reassigned_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RetryEffectsBody {
    pub organization_id: Uuid,
    pub step_id: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub effect_filter: EffectFilter,
    #[serde(default)]
    pub force_retry: bool,
    pub retried_by: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SlaRecalcBody {
    pub organization_id: Uuid,
    pub sla_override_hours: i64,
    #[serde(default)]
    pub recalc_reason: Option<String>,
    pub recalc_by: String,
    #[serde(default)]
    pub allow_past: bool,
}

/// Query parameters for listing workflow executions
#[derive(Debug, Deserialize)]
pub struct ListWorkflowsParams {
    pub organization_id: Uuid,
    pub definition_code: Option<String>,
    pub current_state: Option<ExecutionStatus>,
    pub owner_team: Option<String>,
    pub paused: Option<bool>,
    pub overdue: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// Query parameters for fetching one execution
#[derive(Debug, Deserialize)]
pub struct GetWorkflowParams {
    pub organization_id: Uuid,
    #[serde(default)]
    pub include_steps: bool,
    #[serde(default)]
    pub include_tasks: bool,
    #[serde(default)]
    pub include_timers: bool,
}

/// Create workflow routes
pub fn routes<S: Storage>(state: AppState<S>) -> Router {
    Router::new()
        .route(
            "/v1/workflows",
            get(list_workflows::<S>).post(start_workflow::<S>),
        )
        .route("/v1/workflows/:execution_id", get(get_workflow::<S>))
        .route(
            "/v1/workflows/:execution_id/pause",
            post(pause_workflow::<S>),
        )
        .route(
            "/v1/workflows/:execution_id/resume",
            post(resume_workflow::<S>),
        )
        .route(
            "/v1/workflows/:execution_id/cancel",
            post(cancel_workflow::<S>),
        )
        .route(
            "/v1/workflows/:execution_id/reassign",
            post(reassign_workflow::<S>),
        )
        .route(
            "/v1/workflows/:execution_id/retry-effects",
            post(retry_effects::<S>),
        )
        .route(
            "/v1/workflows/:execution_id/sla-recalc",
            post(sla_recalc::<S>),
        )
        .with_state(state)
}

/// POST /v1/workflows - start an execution
pub async fn start_workflow<S: Storage>(
    State(state): State<AppState<S>>,
    Json(body): Json<StartWorkflowBody>,
) -> Result<(StatusCode, Json<StartReceipt>), ApiError> {
    let receipt = state
        .engine
        .start(StartRequest {
            organization_id: body.organization_id,
            playbook_id: body.playbook_id,
            input_data: body.input_data,
            initiated_by: body.initiated_by,
            owner_team: body.owner_team,
            skip_input_validation: body.skip_input_validation,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /v1/workflows - list executions
pub async fn list_workflows<S: Storage>(
    State(state): State<AppState<S>>,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<ListResponse<steward_core::ExecutionInstance>>, ApiError> {
    let sort_by = match params.sort_by.as_deref() {
        None | Some("started_at") => InstanceSortKey::StartedAt,
        Some("last_activity_at") => InstanceSortKey::LastActivityAt,
        Some(other) => {
            return Err(ApiError(EngineError::validation(format!(
                "unknown sort_by: {other}"
            ))))
        }
    };
    let sort_order = match params.sort_order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return Err(ApiError(EngineError::validation(format!(
                "unknown sort_order: {other}"
            ))))
        }
    };

    let filter = InstanceFilter {
        playbook_id: params.definition_code,
        status: params.current_state,
        owner_team: params.owner_team,
        paused: params.paused,
        overdue: params.overdue,
        created_after: params.created_after,
        created_before: params.created_before,
        sort_by,
        sort_order,
    };
    let page = Page {
        offset: params.offset,
        limit: params.limit,
    };

    let instances = state
        .engine
        .storage()
        .list_instances(params.organization_id, &filter, &page)
        .await
        .map_err(EngineError::from)?;

    Ok(Json(instances.into()))
}

/// GET /v1/workflows/{id} - execution detail
pub async fn get_workflow<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Query(params): Query<GetWorkflowParams>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let detail = state
        .engine
        .describe(
            params.organization_id,
            execution_id,
            DescribeOptions {
                include_steps: params.include_steps,
                include_tasks: params.include_tasks,
                include_timers: params.include_timers,
            },
        )
        .await?;

    Ok(Json(detail))
}

/// POST /v1/workflows/{id}/pause
pub async fn pause_workflow<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<PauseBody>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .pause(PauseRequest {
            organization_id: body.organization_id,
            execution_id,
            reason: body.reason,
            paused_by: body.paused_by,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/workflows/{id}/resume
pub async fn resume_workflow<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<ResumeBody>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .resume(ResumeRequest {
            organization_id: body.organization_id,
            execution_id,
            resumed_by: body.resumed_by,
            notes: body.notes,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/workflows/{id}/cancel
pub async fn cancel_workflow<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .cancel(CancelRequest {
            organization_id: body.organization_id,
            execution_id,
            reason: body.reason,
            cancelled_by: body.cancelled_by,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/workflows/{id}/reassign
pub async fn reassign_workflow<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<ReassignWorkflowBody>,
) -> Result<StatusCode, ApiError> {
    let new_assignee = assignee_from_parts(body.owner_team, body.owner_user_id)?;

    state
        .engine
        .reassign(ReassignRequest {
            organization_id: body.organization_id,
            execution_id,
            new_assignee,
            reassigned_by: body.reassigned_by,
            reason: body.reason,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/workflows/{id}/retry-effects
pub async fn retry_effects<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<RetryEffectsBody>,
) -> Result<Json<steward_engine::RetryEffectsReceipt>, ApiError> {
    let receipt = state
        .engine
        .retry_effects(RetryEffectsRequest {
            organization_id: body.organization_id,
            execution_id,
            step_id: body.step_id,
            effect_filter: body.effect_filter,
            force_retry: body.force_retry,
            retried_by: body.retried_by,
        })
        .await?;
    Ok(Json(receipt))
}

/// POST /v1/workflows/{id}/sla-recalc
pub async fn sla_recalc<S: Storage>(
    State(state): State<AppState<S>>,
    Path(execution_id): Path<Uuid>,
    Json(body): Json<SlaRecalcBody>,
) -> Result<Json<steward_engine::SlaRecalcReceipt>, ApiError> {
    let receipt = state
        .engine
        .recalculate_sla(SlaRecalcRequest {
            organization_id: body.organization_id,
            execution_id,
            sla_override_hours: body.sla_override_hours,
            recalc_reason: body.recalc_reason,
            recalc_by: body.recalc_by,
            allow_past: body.allow_past,
        })
        .await?;
    Ok(Json(receipt))
}
