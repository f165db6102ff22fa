//! HTTP-layer integration tests: request/response contract over the
//! in-memory state store, exercised through an in-process `tower::Service`
//! call rather than a bound socket (§10 "a smaller number of
//! integration-style tests exercise the HTTP layer against the in-memory
//! store via an in-process request client"). Scheduling/retry/graph-analysis
//! invariants are covered at the engine level in `flowrunner-core`; these
//! tests only check that handlers translate requests into the right engine
//! calls and status codes.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use flowrunner_core::node::builtin::{PassthroughNode, StartNode};
use flowrunner_core::node::DefaultPlatform;
use flowrunner_core::persistence::InMemoryStateStore;
use flowrunner_core::{
    Config, Envelope, ExecutionContext, ExecutionEngine, GraphEdge, GraphNode, NodeError, NodeMeta, NodeOutput, NodeRegistry,
    NodeRuntime, Platform, QueueType, TriggerIngress, WorkflowGraph,
};

#[path = "../src/error.rs"]
mod error;
#[path = "../src/graphs.rs"]
mod graphs;
#[path = "../src/health.rs"]
mod health;
#[path = "../src/runs.rs"]
mod runs;
#[path = "../src/state.rs"]
mod state;
#[path = "../src/webhooks.rs"]
mod webhooks;
#[path = "../src/workers.rs"]
mod workers;

use graphs::GraphResolver;
use state::AppState;

/// Doubles `data.n`. Only used by this crate's own end-to-end test; not a
/// built-in node type shipped to callers.
struct DoubleNode;

#[async_trait]
impl NodeRuntime for DoubleNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("double", "Double").with_description("Doubles the `n` field of its input.")
    }

    async fn execute_envelope(&self, _ctx: &ExecutionContext, _config: &Value, mut input: Envelope) -> Result<NodeOutput, NodeError> {
        let n = input.data.get("n").and_then(Value::as_i64).ok_or_else(|| NodeError::permanent("missing field n"))?;
        input.data = json!({ "n": n * 2 });
        Ok(NodeOutput::new(input))
    }
}

fn double_graph() -> WorkflowGraph {
    WorkflowGraph {
        nodes: vec![
            GraphNode { id: "start".into(), node_type: "start".into(), config: Value::Null },
            GraphNode { id: "double".into(), node_type: "double".into(), config: Value::Null },
            GraphNode { id: "result".into(), node_type: "noop".into(), config: Value::Null },
        ],
        edges: vec![
            GraphEdge { id: "e1".into(), source: "start".into(), source_handle: None, target: "double".into(), target_handle: None },
            GraphEdge { id: "e2".into(), source: "double".into(), source_handle: None, target: "result".into(), target_handle: None },
        ],
    }
}

fn test_app() -> (axum::Router, Arc<ExecutionEngine<InMemoryStateStore>>) {
    let store = Arc::new(InMemoryStateStore::new());
    let registry = Arc::new(
        NodeRegistry::builder()
            .register(StartNode)
            .unwrap()
            .register(PassthroughNode)
            .unwrap()
            .register(DoubleNode)
            .unwrap()
            .build(),
    );
    let platform: Arc<dyn Platform> = Arc::new(DefaultPlatform::new());
    let engine = Arc::new(ExecutionEngine::new(store, registry, platform, Config::default()));
    let ingress = Arc::new(TriggerIngress::permissive(engine.clone()));
    let graphs = Arc::new(GraphResolver::new());

    let app_state = AppState { engine: engine.clone(), ingress, graphs, config: Config::default() };
    let router = axum::Router::new()
        .merge(health::routes())
        .merge(runs::routes())
        .merge(workers::routes())
        .merge(webhooks::routes())
        .with_state(app_state);
    (router, engine)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Drains the queue in-process, standing in for a fleet of workers calling
/// `claim-work`/`complete-work` until the run reaches a terminal state.
async fn drain(engine: &ExecutionEngine<InMemoryStateStore>) {
    loop {
        let claimed = engine
            .queue()
            .claim("drain-worker", &[QueueType::StartRun, QueueType::ExecuteStep, QueueType::RetryStep, QueueType::RecoverRun], 10)
            .await
            .unwrap();
        if claimed.is_empty() {
            break;
        }
        for item in &claimed {
            engine.process(item, "drain-worker").await.unwrap();
        }
    }
}

#[tokio::test]
async fn healthz_reports_ok_against_reachable_store() {
    let (app, _engine) = test_app();
    let response = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

/// §8 end-to-end literal test: start -> double -> result over three steps,
/// n:5 becomes n:10, run reaches completed with total_steps=3.
#[tokio::test]
async fn start_double_result_run_completes_with_doubled_output() {
    let (app, engine) = test_app();

    let start_request = Request::builder()
        .method("POST")
        .uri("/workflow-runs")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "agent_id": Uuid::now_v7(), "graph": double_graph(), "input_data": {"n": 5} }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(start_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let started = body_json(response).await;
    let run_id = started["id"].as_str().unwrap().to_string();

    drain(&engine).await;

    let detail_request = Request::builder().uri(format!("/workflow-runs/{run_id}")).body(Body::empty()).unwrap();
    let response = app.oneshot(detail_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await;

    assert_eq!(detail["run"]["status"], "completed");
    assert_eq!(detail["run"]["total_steps"], 3);
    assert_eq!(detail["run"]["completed_steps"], 3);
    assert_eq!(detail["run"]["output"]["data"]["n"], 10);
    assert_eq!(detail["steps"].as_array().unwrap().len(), 3);
    for step in detail["steps"].as_array().unwrap() {
        assert_eq!(step["status"], "completed");
    }
}

#[tokio::test]
async fn start_run_with_unregistered_graph_is_rejected() {
    let (app, _engine) = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/workflow-runs")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "agent_id": Uuid::now_v7(), "input_data": {"n": 1} }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_run_returns_404_for_unknown_id() {
    let (app, _engine) = test_app();
    let request = Request::builder().uri(format!("/workflow-runs/{}", Uuid::now_v7())).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pause_run_then_control_resume_round_trips() {
    let (app, engine) = test_app();

    let start_request = Request::builder()
        .method("POST")
        .uri("/workflow-runs")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "agent_id": Uuid::now_v7(), "graph": double_graph(), "input_data": {"n": 5} }).to_string()))
        .unwrap();
    let started = body_json(app.clone().oneshot(start_request).await.unwrap()).await;
    let run_id = started["id"].as_str().unwrap().to_string();

    // advance past the start_run queue item so there's a pending execute_step item to pause under.
    let start_items = engine.queue().claim("w1", &[QueueType::StartRun], 10).await.unwrap();
    for item in &start_items {
        engine.process(item, "w1").await.unwrap();
    }

    let pause_request = Request::builder()
        .method("POST")
        .uri(format!("/workflow-runs/{run_id}/control"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "action": "pause" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(pause_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let paused = body_json(response).await;
    assert_eq!(paused["status"], "paused");

    let resume_request = Request::builder()
        .method("POST")
        .uri(format!("/workflow-runs/{run_id}/control"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "action": "resume" }).to_string()))
        .unwrap();
    let response = app.oneshot(resume_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let resumed = body_json(response).await;
    assert_eq!(resumed["status"], "running");
}

/// The remote-worker protocol: claim-work hands back an unresolved
/// execute_step item with node_type/config/input, complete-work applies the
/// caller's own result through `report_step_result`, and the run proceeds.
#[tokio::test]
async fn remote_worker_claims_and_completes_execute_step() {
    let (app, engine) = test_app();

    let start_request = Request::builder()
        .method("POST")
        .uri("/workflow-runs")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "agent_id": Uuid::now_v7(), "graph": double_graph(), "input_data": {"n": 5} }).to_string()))
        .unwrap();
    let started = body_json(app.clone().oneshot(start_request).await.unwrap()).await;
    let run_id = started["id"].as_str().unwrap().to_string();

    let register_request = Request::builder()
        .method("POST")
        .uri("/workers")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "id": "remote-1", "hostname": "h1", "version": "0.1.0" }).to_string()))
        .unwrap();
    assert_eq!(app.clone().oneshot(register_request).await.unwrap().status(), StatusCode::OK);

    // First claim resolves the in-process start_run item.
    let claim_request = Request::builder()
        .method("POST")
        .uri("/workers/remote-1/claim-work")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "max_items": 10 }).to_string()))
        .unwrap();
    let first_claim = body_json(app.clone().oneshot(claim_request).await.unwrap()).await;
    assert!(first_claim.as_array().unwrap().iter().all(|item| item["resolved"] == true));

    // Second claim hands back the unresolved "start" node's execute_step item.
    let claim_request = Request::builder()
        .method("POST")
        .uri("/workers/remote-1/claim-work")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "max_items": 10 }).to_string()))
        .unwrap();
    let second_claim = body_json(app.clone().oneshot(claim_request).await.unwrap()).await;
    let items = second_claim.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["resolved"], false);
    assert_eq!(items[0]["node_type"], "start");
    let item_id = items[0]["item_id"].as_str().unwrap().to_string();

    let complete_request = Request::builder()
        .method("POST")
        .uri(format!("/workers/remote-1/complete-work/{item_id}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "success": true, "output": {"n": 5} }).to_string()))
        .unwrap();
    assert_eq!(app.clone().oneshot(complete_request).await.unwrap().status(), StatusCode::NO_CONTENT);

    // finish the remaining in-process steps (double, result).
    drain(&engine).await;

    let detail_request = Request::builder().uri(format!("/workflow-runs/{run_id}")).body(Body::empty()).unwrap();
    let detail = body_json(app.oneshot(detail_request).await.unwrap()).await;
    assert_eq!(detail["run"]["status"], "completed");
    assert_eq!(detail["run"]["output"]["data"]["n"], 10);
}
