//! Action adapter boundary for automated steps
//!
//! The adapter performs the external side effect (call a webhook, send an
//! email, write to another system). The engine records an EffectRecord per
//! attempt and never blocks an API call on the adapter; attempts run when
//! the scheduler claims the step's retry timer.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// One attempt's worth of context handed to the adapter
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,

    /// Action label from the step definition
    pub action: String,

    /// 1-based attempt number
    pub attempt: u32,

    /// `{"input": <instance input>, "context": <accumulated outputs>}`
    pub input: Value,
}

/// Failure of one attempt
#[derive(Debug, Clone)]
pub struct ActionFailure {
    pub message: String,

    /// Retryable failures are retried per the step's retry policy;
    /// non-retryable failures fail the step immediately.
    pub retryable: bool,
}

impl ActionFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Executes automated-step actions.
///
/// Implementations should be idempotent per `(execution_id, step_id,
/// attempt)`: a crashed worker's claim lease can lapse and the attempt may
/// be re-dispatched.
#[async_trait]
pub trait ActionAdapter: Send + Sync + 'static {
    async fn execute(&self, invocation: &ActionInvocation) -> Result<Value, ActionFailure>;
}
