//! Error taxonomy for engine operations

use uuid::Uuid;

/// Errors surfaced by engine operations.
///
/// Validation, permission, and not-found errors are returned to the caller
/// unchanged. State-transition and duplicate errors carry enough context
/// (current state, existing execution id) for the caller to self-correct.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or incomplete input; never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown instance, task, timer, or definition
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation is illegal in the current state
    #[error("cannot {operation} while execution is {current_state}")]
    InvalidStateTransition {
        operation: &'static str,
        current_state: String,
    },

    /// An identical start request is already in progress
    #[error("duplicate start request; execution {existing_execution_id} is already in progress")]
    DuplicateExecution { existing_execution_id: Uuid },

    /// Actor is not allowed to perform the operation
    #[error("permission denied: {actor} may not perform {action}")]
    PermissionDenied { actor: String, action: String },

    /// Automated-step action failure; retried per policy when `retryable`
    #[error("effect execution failed: {message}")]
    EffectExecution { message: String, retryable: bool },

    /// Version conflict that survived the bounded internal retry loop
    #[error("concurrent modification of execution {execution_id} (gave up after {attempts} attempts)")]
    ConcurrentModification { execution_id: Uuid, attempts: u32 },

    /// A timer claim lease lapsed before `mark_fired`; triggers reclaim
    #[error("timer claim expired: {timer_id}")]
    TimerClaimExpired { timer_id: Uuid },

    /// Storage adapter failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create an invalid-state-transition error
    pub fn invalid_transition(operation: &'static str, current_state: impl ToString) -> Self {
        Self::InvalidStateTransition {
            operation,
            current_state: current_state.to_string(),
        }
    }

    /// Create a permission-denied error
    pub fn permission_denied(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            actor: actor.into(),
            action: action.into(),
        }
    }

    /// Whether this error indicates a transient condition worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EffectExecution {
                retryable: true,
                ..
            } | Self::ConcurrentModification { .. }
                | Self::TimerClaimExpired { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = EngineError::invalid_transition("resume", "in_progress");
        assert_eq!(
            err.to_string(),
            "cannot resume while execution is in_progress"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::EffectExecution {
            message: "timeout".into(),
            retryable: true
        }
        .is_retryable());
        assert!(!EngineError::EffectExecution {
            message: "bad payload".into(),
            retryable: false
        }
        .is_retryable());
        assert!(!EngineError::validation("missing field").is_retryable());
    }
}
