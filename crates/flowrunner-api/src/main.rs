//! flowrunner-api: the thin HTTP surface over the durable workflow
//! execution core (§6). Wires a `StateStore` (in-memory or Postgres,
//! chosen by whether `DATABASE_URL` is set), a `NodeRegistry` of the
//! built-in node types, and an `ExecutionEngine` behind an axum router.

mod error;
mod graphs;
mod health;
mod runs;
mod state;
mod webhooks;
mod workers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use flowrunner_core::node::builtin::{ForEachNode, IfNode, MergeNode, PassthroughNode, StartNode, SwitchNode};
use flowrunner_core::node::DefaultPlatform;
use flowrunner_core::persistence::{InMemoryStateStore, PostgresStateStore};
use flowrunner_core::{Config, ExecutionEngine, NodeRegistry, Platform, StateStore, TriggerIngress};

use crate::graphs::GraphResolver;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::healthz,
        runs::start_run,
        runs::list_runs,
        runs::get_run,
        runs::control_run,
        runs::retry_step,
        workers::register_worker,
        workers::deregister_worker,
        workers::heartbeat,
        workers::claim_work,
        workers::complete_work,
        webhooks::receive_webhook,
    ),
    components(schemas(
        health::HealthResponse,
        flowrunner_core::WorkflowRun,
        flowrunner_core::WorkflowStep,
        flowrunner_core::RunStatus,
        flowrunner_core::StepStatus,
        flowrunner_core::Envelope,
        flowrunner_core::Trace,
        flowrunner_core::ErrorDetails,
        flowrunner_core::ErrorKind,
        flowrunner_core::RetryPolicy,
        flowrunner_core::WorkflowGraph,
        flowrunner_core::GraphNode,
        flowrunner_core::GraphEdge,
        flowrunner_core::WorkerRecord,
        flowrunner_core::WorkerStatus,
        flowrunner_core::QueueType,
        runs::StartRunRequest,
        runs::RunDetail,
        runs::ControlAction,
        runs::ControlRequest,
        workers::RegisterWorkerRequest,
        workers::HeartbeatRequest,
        workers::ClaimWorkRequest,
        workers::ClaimedWorkItem,
        workers::CompleteWorkRequest,
        workers::CompleteWorkError,
    )),
    tags(
        (name = "health", description = "Liveness probe"),
        (name = "runs", description = "Workflow run lifecycle: start, list, inspect, control, retry"),
        (name = "workers", description = "Worker registration and the claim-work/complete-work protocol"),
        (name = "webhooks", description = "Webhook trigger ingress"),
    ),
    info(
        title = "flowrunner API",
        version = "0.1.0",
        description = "Durable workflow execution core: runs, steps, the work queue, and the node execution contract",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT"),
    ),
)]
struct ApiDoc;

fn node_registry() -> Result<Arc<NodeRegistry>> {
    let registry = NodeRegistry::builder()
        .register(StartNode)
        .context("registering start node")?
        .register(PassthroughNode)
        .context("registering noop node")?
        .register(IfNode)
        .context("registering if node")?
        .register(SwitchNode)
        .context("registering switch node")?
        .register(ForEachNode)
        .context("registering for_each node")?
        .register(MergeNode)
        .context("registering merge node")?
        .build();
    Ok(Arc::new(registry))
}

fn router<S: StateStore>(app_state: AppState<S>) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(runs::routes())
        .merge(workers::routes())
        .merge(webhooks::routes())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn serve(app: Router, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind to address")?;
    tracing::info!(%addr, "flowrunner-api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "flowrunner_api=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let registry = node_registry()?;
    let platform: Arc<dyn Platform> = Arc::new(DefaultPlatform::new());
    let graphs = Arc::new(GraphResolver::new());
    let addr = std::env::var("FLOWRUNNER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    if let Some(database_url) = config.database_url.clone() {
        tracing::info!("connecting to Postgres state store");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(&database_url)
            .await
            .context("failed to connect to DATABASE_URL")?;
        let store = PostgresStateStore::new(pool);
        store.migrate().await.context("failed to run migrations")?;
        let store = Arc::new(store);
        let engine = Arc::new(ExecutionEngine::new(store, registry, platform, config.clone()));
        let ingress = Arc::new(TriggerIngress::permissive(engine.clone()));
        let app = router(AppState { engine, ingress, graphs, config });
        serve(app, &addr).await
    } else {
        tracing::warn!("DATABASE_URL not set, using in-memory state store (not durable across restarts)");
        let store = Arc::new(InMemoryStateStore::new());
        let engine = Arc::new(ExecutionEngine::new(store, registry, platform, config.clone()));
        let ingress = Arc::new(TriggerIngress::permissive(engine.clone()));
        let app = router(AppState { engine, ingress, graphs, config });
        serve(app, &addr).await
    }
}
