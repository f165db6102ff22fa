//! `/workflow-runs` routes (§6): StartRun, list, detail, control,
//! step retry. Thin handlers — every decision of substance (graph
//! validation, state transitions, retry scheduling) lives in
//! `flowrunner_core::{ExecutionEngine, TriggerIngress}`.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flowrunner_core::trigger::{ManualStartOutcome, SyncWait, TriggerTarget};
use flowrunner_core::{RetryPolicy, RunFilter, RunStatus, StateStore, WorkflowRun, WorkflowStep};

use crate::error::ApiError;
use crate::state::AppState;

/// §4.D StartRun's `run_spec`, plus the seam this crate needs to resolve
/// a graph in place of the out-of-scope workflow/version CRUD layer: a
/// caller either names a previously-registered `(workflow_id,
/// version_id)` pair or supplies `graph` inline.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StartRunRequest {
    pub agent_id: Uuid,
    #[serde(default)]
    pub version_id: Option<Uuid>,
    #[serde(default)]
    pub graph: Option<flowrunner_core::WorkflowGraph>,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub priority: i32,
}

/// Optional `?sync=true&timeout_ms=` on manual start (§9 Open Question:
/// "Sync" mode resolution). Absent entirely, or `sync=false`, is the
/// default fire-and-forget path.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StartRunQuery {
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListRunsQuery {
    pub agent_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RunDetail {
    pub run: WorkflowRun,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ControlRequest {
    pub action: ControlAction,
}

pub fn routes<S: StateStore>() -> Router<AppState<S>> {
    Router::new()
        .route("/workflow-runs", post(start_run::<S>).get(list_runs::<S>))
        .route("/workflow-runs/:id", get(get_run::<S>))
        .route("/workflow-runs/:id/control", post(control_run::<S>))
        .route("/workflow-runs/:id/steps/:step_id/retry", post(retry_step::<S>))
}

/// POST `/workflow-runs` — StartRun (§4.D, §4.F manual trigger).
#[utoipa::path(
    post,
    path = "/workflow-runs",
    request_body = StartRunRequest,
    params(
        ("sync" = Option<bool>, Query, description = "block until the run reaches a terminal state"),
        ("timeout_ms" = Option<u64>, Query, description = "max time to block when sync=true"),
    ),
    responses(
        (status = 201, description = "run started", body = WorkflowRun),
        (status = 400, description = "invalid graph or request"),
    ),
    tag = "runs",
)]
pub async fn start_run<S: StateStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<StartRunQuery>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<WorkflowRun>), ApiError> {
    let version_id = req.version_id.unwrap_or(Uuid::nil());
    let graph = match req.graph {
        Some(graph) => graph,
        None => state
            .graphs
            .resolve(req.agent_id, version_id)
            .map_err(|e| ApiError::Validation(e.to_string()))?,
    };

    let target = TriggerTarget {
        workflow_id: req.agent_id,
        version_id,
        graph,
        timeout_seconds: req.timeout_seconds,
        retry_policy: req.retry_policy,
        priority: req.priority,
    };

    let sync = query.sync.then(|| SyncWait {
        timeout: Duration::from_millis(query.timeout_ms.unwrap_or(30_000)),
        poll_interval: Duration::from_millis(200),
    });

    let outcome = state.ingress.ingest_manual(target, req.input_data, sync).await?;
    let run = match outcome {
        ManualStartOutcome::Finished(run) | ManualStartOutcome::StillRunning(run) => run,
    };
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET `/workflow-runs?agent_id=&status=&limit=&offset=` — paginated list.
#[utoipa::path(
    get,
    path = "/workflow-runs",
    params(ListRunsQuery),
    responses((status = 200, description = "page of runs", body = Vec<WorkflowRun>)),
    tag = "runs",
)]
pub async fn list_runs<S: StateStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<WorkflowRun>>, ApiError> {
    let filter = RunFilter { workflow_id: query.agent_id, status: query.status };
    let runs = state.engine.store().list_runs(filter, query.offset, query.limit).await?;
    Ok(Json(runs))
}

/// GET `/workflow-runs/{id}` — detail + steps.
#[utoipa::path(
    get,
    path = "/workflow-runs/{id}",
    params(("id" = Uuid, Path, description = "run id")),
    responses(
        (status = 200, description = "run detail", body = RunDetail),
        (status = 404, description = "run not found"),
    ),
    tag = "runs",
)]
pub async fn get_run<S: StateStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunDetail>, ApiError> {
    let run = state.engine.store().get_run(id).await?;
    let steps = state.engine.store().list_steps_for_run(id).await?;
    Ok(Json(RunDetail { run, steps }))
}

/// POST `/workflow-runs/{id}/control` — pause/resume/cancel.
#[utoipa::path(
    post,
    path = "/workflow-runs/{id}/control",
    params(("id" = Uuid, Path, description = "run id")),
    request_body = ControlRequest,
    responses(
        (status = 200, description = "run transitioned", body = WorkflowRun),
        (status = 409, description = "run is not in a state that allows this action"),
    ),
    tag = "runs",
)]
pub async fn control_run<S: StateStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<WorkflowRun>, ApiError> {
    let run = match req.action {
        ControlAction::Pause => state.engine.pause_run(id).await?,
        ControlAction::Resume => state.engine.resume_run(id).await?,
        ControlAction::Cancel => state.engine.cancel_run(id).await?,
    };
    Ok(Json(run))
}

/// POST `/workflow-runs/{id}/steps/{step_id}/retry` — RetryStep (§4.D).
#[utoipa::path(
    post,
    path = "/workflow-runs/{id}/steps/{step_id}/retry",
    params(
        ("id" = Uuid, Path, description = "run id"),
        ("step_id" = Uuid, Path, description = "step id"),
    ),
    responses(
        (status = 204, description = "retry enqueued"),
        (status = 409, description = "step is not failed"),
    ),
    tag = "runs",
)]
pub async fn retry_step<S: StateStore>(
    State(state): State<AppState<S>>,
    Path((_run_id, step_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.engine.retry_step(step_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
