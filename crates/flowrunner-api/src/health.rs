//! `GET /healthz` — liveness probe reporting store connectivity (§6,
//! §10). Ambient; not part of the domain model.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use flowrunner_core::{RunFilter, StateStore};

use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub fn routes<S: StateStore>() -> Router<AppState<S>> {
    Router::new().route("/healthz", get(healthz::<S>))
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "store reachable", body = HealthResponse),
        (status = 500, description = "store unreachable", body = HealthResponse),
    ),
    tag = "health",
)]
pub async fn healthz<S: StateStore>(State(state): State<AppState<S>>) -> (StatusCode, Json<HealthResponse>) {
    match state.engine.store().list_runs(RunFilter::default(), 0, 1).await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })),
        Err(err) => {
            tracing::error!(error = %err, "health check: store unreachable");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(HealthResponse { status: "store_unreachable", version: env!("CARGO_PKG_VERSION") }))
        }
    }
}
