//! Scheduler trigger, generic operation dispatch, and definition publish

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde_json::Value;

use steward_core::PlaybookDefinition;
use steward_engine::{SweepArgs, SweepReport};
use steward_storage::Storage;

use crate::common::{ApiError, AppState};

/// Create scheduler and operation-dispatch routes
pub fn routes<S: Storage>(state: AppState<S>) -> Router {
    Router::new()
        .route("/v1/scheduler/sweep", post(trigger_sweep::<S>))
        .route("/v1/operations/:label", post(dispatch_operation::<S>))
        .route("/v1/definitions", post(publish_definition::<S>))
        .with_state(state)
}

/// POST /v1/scheduler/sweep - run one sweep
///
/// `dry_run: true` performs all read/decision logic but suppresses writes
/// and reports what would happen.
pub async fn trigger_sweep<S: Storage>(
    State(state): State<AppState<S>>,
    Json(args): Json<SweepArgs>,
) -> Json<SweepReport> {
    Json(state.scheduler.run_sweep(args).await)
}

/// POST /v1/operations/{label} - dispatch through the typed operation
/// registry by external label
pub async fn dispatch_operation<S: Storage>(
    State(state): State<AppState<S>>,
    Path(label): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let response = state
        .registry
        .dispatch(&state.engine, &label, payload)
        .await?;
    Ok(Json(response))
}

/// POST /v1/definitions - publish a playbook definition
///
/// Used by the authoring process; definitions are immutable once
/// published.
pub async fn publish_definition<S: Storage>(
    State(state): State<AppState<S>>,
    Json(definition): Json<PlaybookDefinition>,
) -> Result<StatusCode, ApiError> {
    state.engine.definitions().publish(definition).await?;
    Ok(StatusCode::CREATED)
}
