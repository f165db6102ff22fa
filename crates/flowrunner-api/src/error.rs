//! Maps engine/store/trigger errors onto the status codes in spec §6:
//! 400 validation, 404 missing, 409 state-conflict, 500 internal. Nothing
//! here leaks internal error text — handlers return a small JSON body
//! with a `message` field, matching §10 "HTTP handlers translate these
//! into the status codes of §6 rather than leaking internal error text".

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use flowrunner_core::trigger::TriggerError;
use flowrunner_core::{EngineError, GraphError, QueueError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

fn store_response(err: &StoreError) -> (StatusCode, String) {
    match err {
        StoreError::RunNotFound(id) => (StatusCode::NOT_FOUND, format!("run not found: {id}")),
        StoreError::StepNotFound(id) => (StatusCode::NOT_FOUND, format!("step not found: {id}")),
        StoreError::WorkerNotFound(id) => (StatusCode::NOT_FOUND, format!("worker not found: {id}")),
        StoreError::QueueItemNotFound(id) => (StatusCode::NOT_FOUND, format!("queue item not found: {id}")),
        StoreError::ClaimNotHeld { item_id } => (
            StatusCode::CONFLICT,
            format!("claim on {item_id} is not held by this worker, or has expired"),
        ),
        StoreError::InvalidRunTransition { from, to } => {
            (StatusCode::CONFLICT, format!("cannot transition run from {from} to {to}"))
        }
        StoreError::Database(_) | StoreError::Serialization(_) => {
            tracing::error!(error = %err, "state store error");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    }
}

fn engine_response(err: &EngineError) -> (StatusCode, String) {
    match err {
        EngineError::Store(inner) => store_response(inner),
        EngineError::Graph(GraphError::CycleDetected(nodes)) => (
            StatusCode::BAD_REQUEST,
            format!("cycle detected involving node(s): {nodes:?}"),
        ),
        EngineError::Graph(_) | EngineError::EmptyGraph | EngineError::UnknownGraphNode(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        EngineError::InvalidTransition { from, to } => {
            (StatusCode::CONFLICT, format!("cannot transition run from {from} to {to}"))
        }
        EngineError::StepNotFailed(id) => (StatusCode::CONFLICT, format!("step {id} is not failed, cannot retry")),
        EngineError::Queue(_) | EngineError::Registry(_) | EngineError::MissingStepId(_) => {
            tracing::error!(error = %err, "engine error");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Store(err) => store_response(err),
            ApiError::Engine(err) => engine_response(err),
            ApiError::Queue(QueueError::Store(err)) => store_response(err),
            ApiError::Trigger(TriggerError::Rejected(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Trigger(TriggerError::Engine(err)) => engine_response(err),
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}
