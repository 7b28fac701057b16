//! Shared API state, response wrappers, and error mapping

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use steward_core::EngineError;
use steward_engine::{ExecutionEngine, OperationRegistry, Scheduler};
use steward_storage::Storage;

/// App state shared across routes
pub struct AppState<S: Storage> {
    pub engine: Arc<ExecutionEngine<S>>,
    pub scheduler: Arc<Scheduler<S>>,
    pub registry: Arc<OperationRegistry<S>>,
}

impl<S: Storage> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
        }
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Engine error carried to the HTTP boundary.
///
/// Validation/permission/not-found errors pass through unchanged;
/// state-transition and duplicate errors carry enough context (current
/// state, existing execution id) for the caller to self-correct.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::Validation(_) | EngineError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::InvalidStateTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_state_transition")
            }
            EngineError::DuplicateExecution { .. } => (StatusCode::CONFLICT, "duplicate_execution"),
            EngineError::ConcurrentModification { .. } => {
                (StatusCode::CONFLICT, "concurrent_modification")
            }
            EngineError::PermissionDenied { .. } => (StatusCode::FORBIDDEN, "permission_denied"),
            EngineError::EffectExecution { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "effect_execution_failed")
            }
            EngineError::TimerClaimExpired { .. } | EngineError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }

        let mut body = json!({
            "error": self.0.to_string(),
            "code": code,
        });

        // Self-correction context
        if let EngineError::DuplicateExecution {
            existing_execution_id,
        } = &self.0
        {
            body["existing_execution_id"] = json!(existing_execution_id);
        }
        if let EngineError::InvalidStateTransition { current_state, .. } = &self.0 {
            body["current_state"] = json!(current_state);
        }

        (status, Json(body)).into_response()
    }
}

/// Turn an assignee XOR pair (role or user id) into the typed assignee
pub fn assignee_from_parts(
    role: Option<String>,
    user_id: Option<String>,
) -> Result<steward_core::Assignee, ApiError> {
    match (role, user_id) {
        (Some(role), None) => Ok(steward_core::Assignee::Role(role)),
        (None, Some(user)) => Ok(steward_core::Assignee::User(user)),
        _ => Err(ApiError(EngineError::validation(
            "exactly one of owner_team/assignee_role or owner_user_id/assignee_user_id is required",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignee_requires_exactly_one() {
        assert!(assignee_from_parts(Some("ops".into()), None).is_ok());
        assert!(assignee_from_parts(None, Some("u-1".into())).is_ok());
        assert!(assignee_from_parts(None, None).is_err());
        assert!(assignee_from_parts(Some("ops".into()), Some("u-1".into())).is_err());
    }
}
