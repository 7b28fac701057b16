// Steward API server
// Decision: the action adapter and authorization adapter are wired at
// startup; the defaults (noop action, allow-all authz) suit deployments
// that integrate those concerns upstream.

mod common;
mod scheduler;
mod tasks;
mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use steward_engine::{
    ActionAdapter, ActionFailure, ActionInvocation, AllowAll, EngineConfig, ExecutionEngine,
    OperationRegistry, Scheduler, SweepArgs, SweepConfig,
};
use steward_storage::PostgresStorage;

use common::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Stand-in action adapter. Deployments wire their integration adapter
/// here; until then automated steps fail loudly instead of pretending the
/// side effect happened.
struct NoopActionAdapter;

#[async_trait]
impl ActionAdapter for NoopActionAdapter {
    async fn execute(
        &self,
        invocation: &ActionInvocation,
    ) -> std::result::Result<serde_json::Value, ActionFailure> {
        tracing::warn!(action = %invocation.action, "no action adapter configured");
        Err(ActionFailure::non_retryable(
            "no action adapter configured",
        ))
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Steward API",
        description = "Business process execution engine"
    ),
    components(schemas(
        workflows::StartWorkflowBody,
        workflows::PauseBody,
        workflows::ResumeBody,
        workflows::CancelBody,
        workflows::ReassignWorkflowBody,
        workflows::RetryEffectsBody,
        workflows::SlaRecalcBody,
        tasks::ReassignTaskBody,
        tasks::CompleteTaskBody,
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    let storage = Arc::new(PostgresStorage::new(pool));
    storage.migrate().await.context("migration failed")?;

    let engine = Arc::new(ExecutionEngine::new(
        storage,
        Arc::new(NoopActionAdapter),
        Arc::new(AllowAll),
        EngineConfig::default(),
    ));

    let state = AppState {
        scheduler: Arc::new(Scheduler::new(engine.clone(), SweepConfig::default())),
        registry: Arc::new(OperationRegistry::standard()),
        engine,
    };

    // Optional in-process sweep loop; most deployments trigger sweeps via
    // the endpoint from an external cron instead.
    if let Ok(secs) = std::env::var("STEWARD_SWEEP_INTERVAL_SECS") {
        if let Ok(secs) = secs.parse::<u64>() {
            let sweeper = state.scheduler.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
                loop {
                    interval.tick().await;
                    let report = sweeper.run_sweep(SweepArgs::default()).await;
                    if !report.errors.is_empty() {
                        tracing::warn!(errors = report.errors.len(), "sweep completed with errors");
                    }
                }
            });
        }
    }

    let app = Router::new()
        .route("/health", get(health))
        .merge(workflows::routes(state.clone()))
        .merge(tasks::routes(state.clone()))
        .merge(scheduler::routes(state))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("STEWARD_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
