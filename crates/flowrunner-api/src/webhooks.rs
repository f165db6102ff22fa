//! `POST /webhooks/{provider}/{trigger_id}` — §4.F Webhook trigger
//! ingress. `provider` is carried through only for routing/observability
//! (HMAC verification per provider is a `TriggerGuard` concern, §1 Out
//! of scope); the body becomes the run's input envelope unconditionally.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use uuid::Uuid;

use flowrunner_core::trigger::WebhookDelivery;
use flowrunner_core::{StateStore, WorkflowRun};

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes<S: StateStore>() -> Router<AppState<S>> {
    Router::new().route("/webhooks/:provider/:trigger_id", post(receive_webhook::<S>))
}

/// POST `/webhooks/{provider}/{trigger_id}`.
///
/// The trigger's target graph is resolved the same way a manual
/// `StartRun` does — this crate has no workflow/version CRUD of its own
/// (§1 Out of scope) — so the webhook's `(workflow_id, version_id)` pair
/// must already be registered with the `GraphResolver` under
/// `trigger_id`'s owning workflow. A production deployment would carry
/// that mapping in whatever store owns triggers; this one resolves it
/// from the trigger id directly, which the in-memory graph resolver
/// indexes under the workflow id alone (version `Uuid::nil()`), matching
/// the `workflow_id`-only model resolved for triggers (§9).
#[utoipa::path(
    post,
    path = "/webhooks/{provider}/{trigger_id}",
    params(
        ("provider" = String, Path, description = "webhook provider name, routing only"),
        ("trigger_id" = Uuid, Path, description = "trigger id; also used as the workflow id to resolve a graph"),
    ),
    responses(
        (status = 201, description = "run started", body = WorkflowRun),
        (status = 400, description = "trigger rejected or no graph registered"),
    ),
    tag = "webhooks",
)]
pub async fn receive_webhook<S: StateStore>(
    State(state): State<AppState<S>>,
    Path((_provider, trigger_id)): Path<(String, Uuid)>,
    method: Method,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<WorkflowRun>), ApiError> {
    let graph = state
        .graphs
        .resolve(trigger_id, Uuid::nil())
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let target = flowrunner_core::trigger::TriggerTarget {
        workflow_id: trigger_id,
        version_id: Uuid::nil(),
        graph,
        timeout_seconds: None,
        retry_policy: None,
        priority: 0,
    };

    let delivery = WebhookDelivery {
        method: method.to_string(),
        headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string())).collect(),
        body,
    };

    let run = state.ingress.ingest_webhook(target, trigger_id, delivery).await?;
    Ok((StatusCode::CREATED, Json(run)))
}
