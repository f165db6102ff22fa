//! `/workers` routes (§4.E, §6): registration, heartbeat, deregistration,
//! and the claim-work/complete-work protocol a remote worker process
//! uses in place of running a `NodeRegistry` in the same process as the
//! engine. `start_run`/`retry_step`/`recover_run` items never reach a
//! node at all, so `claim_work` resolves those immediately through
//! `ExecutionEngine::process` and only hands `execute_step` items back
//! to the caller to run themselves.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flowrunner_core::{
    ClaimPrepOutcome, ErrorDetails, ErrorKind, NodeOutput, QueueType, StateStore, WorkerRecord, WorkerStatus,
};
use flowrunner_core::persistence::ClaimedQueueItem;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes<S: StateStore>() -> Router<AppState<S>> {
    Router::new()
        .route("/workers", post(register_worker::<S>))
        .route("/workers/:id", delete(deregister_worker::<S>))
        .route("/workers/:id/heartbeat", put(heartbeat::<S>))
        .route("/workers/:id/claim-work", post(claim_work::<S>))
        .route("/workers/:id/complete-work/:item_id", post(complete_work::<S>))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RegisterWorkerRequest {
    pub id: String,
    pub hostname: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_steps: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

/// POST `/workers` — idempotent register (§4.E, §8).
#[utoipa::path(
    post,
    path = "/workers",
    request_body = RegisterWorkerRequest,
    responses((status = 200, description = "worker registered", body = WorkerRecord)),
    tag = "workers",
)]
pub async fn register_worker<S: StateStore>(
    State(state): State<AppState<S>>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Json<WorkerRecord>, ApiError> {
    let now = Utc::now();
    let worker = WorkerRecord {
        id: req.id,
        hostname: req.hostname,
        version: req.version,
        capabilities: req.capabilities,
        status: WorkerStatus::Idle,
        last_heartbeat_at: now,
        started_at: now,
        max_concurrent_steps: req.max_concurrent_steps,
        current_step_count: 0,
        lifetime_completed: 0,
        lifetime_failed: 0,
    };
    let registered = state.engine.store().register_worker(worker).await?;
    Ok(Json(registered))
}

/// DELETE `/workers/{id}` — deregister (graceful shutdown, §4.E).
#[utoipa::path(
    delete,
    path = "/workers/{id}",
    params(("id" = String, Path, description = "worker id")),
    responses((status = 204, description = "worker deregistered")),
    tag = "workers",
)]
pub async fn deregister_worker<S: StateStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.store().deregister_worker(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub current_step_count: u32,
}

/// PUT `/workers/{id}/heartbeat` (§4.E).
#[utoipa::path(
    put,
    path = "/workers/{id}/heartbeat",
    params(("id" = String, Path, description = "worker id")),
    request_body = HeartbeatRequest,
    responses(
        (status = 204, description = "heartbeat recorded"),
        (status = 404, description = "worker not registered"),
    ),
    tag = "workers",
)]
pub async fn heartbeat<S: StateStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    state.engine.store().heartbeat_worker(&id, req.current_step_count).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ClaimWorkRequest {
    #[serde(default = "default_claim_limit")]
    pub max_items: u32,
}

fn default_claim_limit() -> u32 {
    1
}

/// One claimed item as handed to a remote worker. `node_type`/`config`/
/// `input` are only populated when `resolved` is `false` — the caller
/// must execute the node itself and report the result to
/// `complete-work`. When `resolved` is `true` the engine already drove
/// this item to completion in-process (`start_run`/`retry_step`/
/// `recover_run` items never reach a node) and there is nothing further
/// for the caller to do.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ClaimedWorkItem {
    pub item_id: Uuid,
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub queue_type: QueueType,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// POST `/workers/{id}/claim-work` — Claim (§4.A operation 1, §4.E).
#[utoipa::path(
    post,
    path = "/workers/{id}/claim-work",
    params(("id" = String, Path, description = "worker id")),
    request_body = ClaimWorkRequest,
    responses((status = 200, description = "claimed items", body = Vec<ClaimedWorkItem>)),
    tag = "workers",
)]
pub async fn claim_work<S: StateStore>(
    State(state): State<AppState<S>>,
    Path(worker_id): Path<String>,
    Json(req): Json<ClaimWorkRequest>,
) -> Result<Json<Vec<ClaimedWorkItem>>, ApiError> {
    let workers = state.engine.store().list_workers(Default::default()).await?;
    let capabilities: Vec<QueueType> = workers
        .iter()
        .find(|w| w.id == worker_id)
        .map(|w| w.capabilities.iter().filter_map(|c| QueueType::from_str(c).ok()).collect())
        .filter(|v: &Vec<QueueType>| !v.is_empty())
        .unwrap_or_else(|| vec![QueueType::StartRun, QueueType::ExecuteStep, QueueType::RetryStep, QueueType::RecoverRun]);

    let claimed = state.engine.queue().claim(&worker_id, &capabilities, req.max_items).await?;
    let mut out = Vec::with_capacity(claimed.len());
    for item in claimed {
        if item.item.queue_type != QueueType::ExecuteStep {
            state.engine.process(&item, &worker_id).await?;
            out.push(ClaimedWorkItem {
                item_id: item.item.id,
                run_id: item.item.run_id,
                step_id: item.item.payload.step_id,
                queue_type: item.item.queue_type,
                resolved: true,
                node_type: None,
                config: None,
                input: None,
            });
            continue;
        }

        match state.engine.prepare_execute_step(&item, &worker_id).await? {
            ClaimPrepOutcome::Released(_) => out.push(ClaimedWorkItem {
                item_id: item.item.id,
                run_id: item.item.run_id,
                step_id: item.item.payload.step_id,
                queue_type: item.item.queue_type,
                resolved: true,
                node_type: None,
                config: None,
                input: None,
            }),
            ClaimPrepOutcome::Ready(prepared) => out.push(ClaimedWorkItem {
                item_id: item.item.id,
                run_id: item.item.run_id,
                step_id: item.item.payload.step_id,
                queue_type: item.item.queue_type,
                resolved: false,
                node_type: Some(prepared.step.node_type.clone()),
                config: Some(prepared.step.node_config.clone()),
                input: Some(prepared.input.data.clone()),
            }),
        }
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CompleteWorkRequest {
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub error: Option<CompleteWorkError>,
    /// Run-variable writes the remote worker wants persisted alongside this
    /// step's completion, merged last-writer-wins into the run's variables.
    #[serde(default)]
    pub variables: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CompleteWorkError {
    #[serde(default = "default_error_kind")]
    pub kind: ErrorKind,
    pub message: String,
}

fn default_error_kind() -> ErrorKind {
    ErrorKind::Permanent
}

/// POST `/workers/{id}/complete-work/{item_id}` — a remote worker
/// reporting the result of a node it executed itself (§4.A operation 2,
/// §4.E). Rejects a stale or already-expired lease the same way
/// `StateStore::complete_queue_item`/`fail_queue_item` do.
#[utoipa::path(
    post,
    path = "/workers/{id}/complete-work/{item_id}",
    params(
        ("id" = String, Path, description = "worker id"),
        ("item_id" = Uuid, Path, description = "claimed queue item id"),
    ),
    request_body = CompleteWorkRequest,
    responses(
        (status = 204, description = "result applied"),
        (status = 409, description = "claim not held by this worker, or expired"),
    ),
    tag = "workers",
)]
pub async fn complete_work<S: StateStore>(
    State(state): State<AppState<S>>,
    Path((worker_id, item_id)): Path<(String, Uuid)>,
    Json(req): Json<CompleteWorkRequest>,
) -> Result<StatusCode, ApiError> {
    let queue_item = state.engine.store().get_queue_item(item_id).await?;
    let step_id = queue_item
        .payload
        .step_id
        .ok_or_else(|| ApiError::Validation(format!("queue item {item_id} carries no step id")))?;
    let step = state.engine.store().get_step(step_id).await?;

    let result = if req.success {
        let envelope = step
            .input
            .clone()
            .map(|mut env| {
                env.data = req.output.clone().unwrap_or(Value::Null);
                env
            })
            .ok_or_else(|| ApiError::Validation(format!("step {step_id} has no input envelope to extend")))?;
        let mut output = match req.handle.clone() {
            Some(handle) => NodeOutput::on_handle(envelope, handle),
            None => NodeOutput::new(envelope),
        };
        if let Some(patch) = req.variables.clone() {
            output = output.with_variables_patch(patch);
        }
        Ok(output)
    } else {
        let err = req.error.unwrap_or(CompleteWorkError { kind: ErrorKind::Permanent, message: "worker reported failure".into() });
        Err(ErrorDetails::new(err.kind, err.message))
    };

    let claimed = ClaimedQueueItem { item: queue_item };
    state.engine.report_step_result(&claimed, &worker_id, result).await?;
    Ok(StatusCode::NO_CONTENT)
}
