//! Typed operation registry
//!
//! Each external operation is a unit type with compile-time-checked
//! request/response types; the string identifier survives only as an
//! external-facing label. The registry maps labels to JSON-in/JSON-out
//! dispatchers built from the typed implementations, for callers that
//! address operations by name (the generic dispatch endpoint).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use steward_core::EngineError;
use steward_storage::Storage;

use crate::engine::{
    CancelRequest, CompleteTaskRequest, ExecutionEngine, PauseRequest, ReassignRequest,
    ReassignTaskRequest, ResumeRequest, StartReceipt, StartRequest,
};
use crate::runner::{RetryEffectsReceipt, RetryEffectsRequest};
use crate::timers::{SlaRecalcReceipt, SlaRecalcRequest};

/// A typed engine operation.
///
/// `LABEL` is the external identifier (also used as the authorization
/// action name); request/response types are checked at compile time.
#[async_trait]
pub trait Operation<S: Storage>: Send + Sync + 'static {
    const LABEL: &'static str;
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError>;
}

type Handler<S> = Box<
    dyn Fn(Arc<ExecutionEngine<S>>, Value) -> BoxFuture<'static, Result<Value, EngineError>>
        + Send
        + Sync,
>;

/// Label-addressed dispatch over the typed operations
pub struct OperationRegistry<S: Storage> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S: Storage> OperationRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in operation
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register::<StartWorkflow>();
        registry.register::<PauseWorkflow>();
        registry.register::<ResumeWorkflow>();
        registry.register::<CancelWorkflow>();
        registry.register::<ReassignWorkflow>();
        registry.register::<RetryEffects>();
        registry.register::<RecalculateSla>();
        registry.register::<ReassignTask>();
        registry.register::<CompleteTask>();
        registry
    }

    pub fn register<O: Operation<S>>(&mut self) {
        self.handlers.insert(
            O::LABEL,
            Box::new(move |engine, payload| {
                Box::pin(async move {
                    let request: O::Request = serde_json::from_value(payload)
                        .map_err(|e| EngineError::validation(format!("request body: {e}")))?;
                    let response = O::call(&engine, request).await?;
                    Ok(serde_json::to_value(response)?)
                }) as BoxFuture<'static, Result<Value, EngineError>>
            }),
        );
    }

    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels: Vec<&'static str> = self.handlers.keys().copied().collect();
        labels.sort_unstable();
        labels
    }

    /// Dispatch by external label
    pub async fn dispatch(
        &self,
        engine: &Arc<ExecutionEngine<S>>,
        label: &str,
        payload: Value,
    ) -> Result<Value, EngineError> {
        let handler = self
            .handlers
            .get(label)
            .ok_or_else(|| EngineError::not_found("operation", label))?;
        handler(engine.clone(), payload).await
    }
}

impl<S: Storage> Default for OperationRegistry<S> {
    fn default() -> Self {
        Self::standard()
    }
}

// =============================================================================
// Built-in operations
// =============================================================================

pub struct StartWorkflow;

#[async_trait]
impl<S: Storage> Operation<S> for StartWorkflow {
    const LABEL: &'static str = "workflow.start";
    type Request = StartRequest;
    type Response = StartReceipt;

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.start(request).await
    }
}

pub struct PauseWorkflow;

#[async_trait]
impl<S: Storage> Operation<S> for PauseWorkflow {
    const LABEL: &'static str = "workflow.pause";
    type Request = PauseRequest;
    type Response = ();

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.pause(request).await
    }
}

pub struct ResumeWorkflow;

#[async_trait]
impl<S: Storage> Operation<S> for ResumeWorkflow {
    const LABEL: &'static str = "workflow.resume";
    type Request = ResumeRequest;
    type Response = ();

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.resume(request).await
    }
}

pub struct CancelWorkflow;

#[async_trait]
impl<S: Storage> Operation<S> for CancelWorkflow {
    const LABEL: &'static str = "workflow.cancel";
    type Request = CancelRequest;
    type Response = ();

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.cancel(request).await
    }
}

pub struct ReassignWorkflow;

#[async_trait]
impl<S: Storage> Operation<S> for ReassignWorkflow {
    const LABEL: &'static str = "workflow.reassign";
    type Request = ReassignRequest;
    type Response = ();

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.reassign(request).await
    }
}

pub struct RetryEffects;

#[async_trait]
impl<S: Storage> Operation<S> for RetryEffects {
    const LABEL: &'static str = "workflow.retry_effects";
    type Request = RetryEffectsRequest;
    type Response = RetryEffectsReceipt;

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.retry_effects(request).await
    }
}

pub struct RecalculateSla;

#[async_trait]
impl<S: Storage> Operation<S> for RecalculateSla {
    const LABEL: &'static str = "workflow.sla_recalc";
    type Request = SlaRecalcRequest;
    type Response = SlaRecalcReceipt;

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.recalculate_sla(request).await
    }
}

pub struct ReassignTask;

#[async_trait]
impl<S: Storage> Operation<S> for ReassignTask {
    const LABEL: &'static str = "task.reassign";
    type Request = ReassignTaskRequest;
    type Response = ();

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.reassign_task(request).await
    }
}

pub struct CompleteTask;

#[async_trait]
impl<S: Storage> Operation<S> for CompleteTask {
    const LABEL: &'static str = "task.complete";
    type Request = CompleteTaskRequest;
    type Response = ();

    async fn call(
        engine: &ExecutionEngine<S>,
        request: Self::Request,
    ) -> Result<Self::Response, EngineError> {
        engine.complete_task(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_labels() {
        let registry: OperationRegistry<steward_storage::InMemoryStorage> =
            OperationRegistry::standard();
        let labels = registry.labels();

        assert!(labels.contains(&"workflow.start"));
        assert!(labels.contains(&"workflow.retry_effects"));
        assert!(labels.contains(&"task.complete"));
        assert_eq!(labels.len(), 9);
    }
}
