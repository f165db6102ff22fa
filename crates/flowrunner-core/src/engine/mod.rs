//! The Execution Engine (§4.D): drives a run from `pending` to a
//! terminal state one claimed queue item at a time. `StartRun`,
//! `PauseRun`, `ResumeRun`, `CancelRun` and `RetryStep` are the
//! operator/API-facing surface; `process` is what a worker calls after
//! `WorkQueue::claim` for every queue type, since `start_run`,
//! `execute_step`, `retry_step` and `recover_run` items all need
//! different handling but share one claim/complete/fail lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{
    CheckpointType, Envelope, ErrorDetails, ErrorKind, NewCheckpoint, NewQueueItem, NewRun, NewStep,
    QueueType, RetryPolicy, RunFilter, RunStatus, StepStatus, Trace, WorkflowGraph, WorkflowRun,
    WorkflowStep,
};
use crate::node::{CancellationHandle, ExecutionContext, NodeError, NodeOutput, NodeRegistry, Platform, RegistryError};
use crate::persistence::{Advance, ClaimedQueueItem, FanOutChild, StateStore, StoreError, SuccessorSpec};
use crate::queue::{QueueError, WorkQueue};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Graph(#[from] crate::model::GraphError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("queue item {0} carries no step id")]
    MissingStepId(Uuid),
    #[error("graph has no entry points")]
    EmptyGraph,
    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("step {0} is not failed, cannot retry")]
    StepNotFailed(Uuid),
    #[error("edge targets unknown node {0:?}")]
    UnknownGraphNode(String),
}

/// What `StartRun` needs to create a run: everything in the spec's
/// `run_spec` input (§4.D) plus the graph snapshot, since version/draft
/// storage is out of scope here and the caller (an API handler backed
/// by whatever owns workflow definitions) resolves the graph first.
#[derive(Debug, Clone)]
pub struct StartRunSpec {
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub trigger_id: Option<Uuid>,
    pub graph: WorkflowGraph,
    pub input: Value,
    pub variables: serde_json::Map<String, Value>,
    pub timeout_seconds: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub priority: i32,
}

/// What happened to a claimed queue item once `process` returned —
/// purely informational, for callers (the worker pool, tests) that want
/// to log or assert on it; the queue-item bookkeeping is already done
/// by the time this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Retrying,
    Failed,
    Skipped,
    Suspended,
    RunNotRunning,
    StartDispatched,
    RetryDispatched,
    TimeoutChecked,
}

/// What `prepare_execute_step` hands back once a step's run status has
/// been checked and its merged input built: either the item was
/// released untouched (run paused or already terminal), or the step is
/// `running` and ready for a node — in-process or remote — to execute.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub step: WorkflowStep,
    pub input: Envelope,
}

#[derive(Debug, Clone)]
pub enum ClaimPrepOutcome {
    Ready(PreparedStep),
    Released(StepOutcome),
}

/// Drives runs through the state machine in §4.D. Holds the store, the
/// work queue built over it, the node registry, and the `Platform`
/// handed to every node execution. One engine is shared (behind an
/// `Arc`) across the HTTP layer and every worker in-process; remote
/// workers reach it only through the HTTP surface.
pub struct ExecutionEngine<S: StateStore> {
    store: Arc<S>,
    queue: WorkQueue<S>,
    registry: Arc<NodeRegistry>,
    platform: Arc<dyn Platform>,
    config: Config,
    /// In-flight cancellation handles keyed by step id, so `CancelRun`
    /// can cooperatively signal steps this same process is currently
    /// executing (§5 Cancellation). Never consulted for correctness —
    /// the durable signal is the run's `status` column, re-checked by
    /// `execute_step` on every claim.
    cancellations: DashMap<Uuid, CancellationHandle>,
}

impl<S: StateStore> ExecutionEngine<S> {
    pub fn new(store: Arc<S>, registry: Arc<NodeRegistry>, platform: Arc<dyn Platform>, config: Config) -> Self {
        let queue = WorkQueue::new(store.clone(), config.claim_lease());
        Self { store, queue, registry, platform, config, cancellations: DashMap::new() }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue<S> {
        &self.queue
    }

    // -- Public control surface (§4.D) --------------------------------

    /// §4.D StartRun: validate the graph, persist the run `pending` with
    /// one step per entry point, and queue a `start_run` item. The run
    /// only becomes `running` once that item is dispatched — see
    /// `dispatch_start_run` — so `StartRun` itself never touches a
    /// step's queue item directly.
    pub async fn start_run(&self, spec: StartRunSpec) -> Result<WorkflowRun, EngineError> {
        spec.graph.levels()?;
        let entry_points: Vec<String> = spec.graph.entry_points().into_iter().map(str::to_string).collect();
        if entry_points.is_empty() {
            return Err(EngineError::EmptyGraph);
        }

        let run_id = Uuid::now_v7();
        let retry_policy = spec.retry_policy.unwrap_or(self.config.default_retry_policy);
        let trace = Trace::new(spec.workflow_id, run_id, "trigger", 0);
        let input = Envelope::new(spec.input, trace).with_variables(spec.variables.clone());

        let run = self
            .store
            .create_run(NewRun {
                id: run_id,
                workflow_id: spec.workflow_id,
                version_id: spec.version_id,
                trigger_id: spec.trigger_id,
                input,
                variables: spec.variables,
                timeout_seconds: spec.timeout_seconds.unwrap_or(self.config.default_run_timeout_s),
                retry_policy,
                priority: spec.priority,
                graph: spec.graph,
            })
            .await?;

        let new_steps: Vec<NewStep> = entry_points
            .iter()
            .enumerate()
            .map(|(idx, node_id)| {
                let node = run.graph.node(node_id).expect("entry point id comes from this graph");
                NewStep {
                    run_id: run.id,
                    node_id: node_id.clone(),
                    node_type: node.node_type.clone(),
                    step_number: (idx + 1) as u32,
                    node_config: node.config.clone(),
                    depends_on: Vec::new(),
                    max_attempts: retry_policy.max_attempts,
                    group_id: None,
                }
            })
            .collect();
        self.store.create_steps(new_steps).await?;

        self.queue.enqueue(run.id, QueueType::StartRun, None, spec.priority, 1, None).await?;
        info!(run_id = %run.id, workflow_id = %run.workflow_id, entry_points = entry_points.len(), "run started");
        Ok(run)
    }

    /// §4.D PauseRun: `running` → `paused` only.
    pub async fn pause_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(EngineError::InvalidTransition { from: run.status, to: RunStatus::Paused });
        }
        Ok(self.store.update_run_status(run_id, RunStatus::Paused, None, None).await?)
    }

    /// §4.D ResumeRun: `paused` → `running`, then re-enqueue every
    /// `pending` step whose dependencies are already satisfied (steps
    /// not yet ready stay untouched — their own predecessor completing
    /// will enqueue them through the normal `complete_step_and_advance`
    /// path).
    pub async fn resume_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(EngineError::InvalidTransition { from: run.status, to: RunStatus::Running });
        }
        let updated = self.store.update_run_status(run_id, RunStatus::Running, None, None).await?;

        let steps = self.store.list_steps_for_run(run_id).await?;
        let status_by_id: HashMap<Uuid, StepStatus> = steps.iter().map(|s| (s.id, s.status)).collect();
        for step in &steps {
            if step.status != StepStatus::Pending {
                continue;
            }
            let ready = step.depends_on.iter().all(|dep| {
                matches!(status_by_id.get(dep), Some(StepStatus::Completed) | Some(StepStatus::Skipped))
            });
            if ready {
                self.queue
                    .enqueue(run_id, QueueType::ExecuteStep, Some(step.id), 0, step.max_attempts, None)
                    .await?;
            }
        }
        info!(run_id = %run_id, "run resumed");
        Ok(updated)
    }

    /// §4.D CancelRun: `cancelled` from any non-terminal status. Pending
    /// steps are dropped immediately; unclaimed queue items are deleted
    /// in bulk (§8 invariant 3); steps this process currently has in
    /// flight get their cooperative cancellation flag flipped.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidTransition { from: run.status, to: RunStatus::Cancelled });
        }

        let steps = self.store.list_steps_for_run(run_id).await?;
        for step in &steps {
            match step.status {
                StepStatus::Pending => {
                    self.store.skip_step(step.id).await?;
                }
                StepStatus::Running => {
                    if let Some(handle) = self.cancellations.get(&step.id) {
                        handle.cancel();
                    }
                }
                _ => {}
            }
        }
        self.store.cancel_run_queue_items(run_id).await?;
        let updated = self.store.update_run_status(run_id, RunStatus::Cancelled, None, None).await?;
        info!(run_id = %run_id, "run cancelled");
        Ok(updated)
    }

    /// §4.D RetryStep: only valid for a `failed` step. Goes through the
    /// queue (a `retry_step` item) rather than resetting the step
    /// directly, so retries claimed by a remote worker go through the
    /// same lease/backoff machinery as everything else.
    pub async fn retry_step(&self, step_id: Uuid) -> Result<(), EngineError> {
        let step = self.store.get_step(step_id).await?;
        if step.status != StepStatus::Failed {
            return Err(EngineError::StepNotFailed(step_id));
        }
        self.queue.enqueue(step.run_id, QueueType::RetryStep, Some(step_id), 0, 1, None).await?;
        Ok(())
    }

    /// Enqueues a `recover_run` item for every currently-`running` run,
    /// for a periodic reaper (the worker pool's stale-reclaim loop) to
    /// pick up; `process_recover_run` is the one that actually checks
    /// whether a given run's `timeout_seconds` has elapsed, so over-
    /// enqueuing here costs an extra claim/complete round trip, not a
    /// correctness problem.
    pub async fn check_run_timeouts(&self) -> Result<u32, EngineError> {
        let running = self.store.list_runs(RunFilter { status: Some(RunStatus::Running), ..Default::default() }, 0, 10_000).await?;
        for run in &running {
            self.queue.enqueue(run.id, QueueType::RecoverRun, None, 0, 1, None).await?;
        }
        Ok(running.len() as u32)
    }

    // -- Worker-facing dispatch -----------------------------------------

    /// Single entry point a worker calls after claiming an item,
    /// regardless of its `queue_type`. Always resolves to either the
    /// item being completed or requeued with backoff — never leaves a
    /// claimed item dangling.
    pub async fn process(&self, claimed: &ClaimedQueueItem, worker_id: &str) -> Result<StepOutcome, EngineError> {
        match claimed.item.queue_type {
            QueueType::StartRun => self.dispatch_start_run(claimed, worker_id).await,
            QueueType::ExecuteStep => self.execute_step(claimed, worker_id).await,
            QueueType::RetryStep => self.dispatch_retry_step(claimed, worker_id).await,
            QueueType::RecoverRun => self.process_recover_run(claimed, worker_id).await,
        }
    }

    async fn dispatch_start_run(&self, claimed: &ClaimedQueueItem, worker_id: &str) -> Result<StepOutcome, EngineError> {
        let item = &claimed.item;
        let run = self.store.get_run(item.run_id).await?;
        if run.status.is_terminal() || run.status == RunStatus::Paused {
            self.queue.complete(item.id, worker_id).await?;
            return Ok(StepOutcome::RunNotRunning);
        }

        let steps = self.store.list_steps_for_run(run.id).await?;
        for step in steps.iter().filter(|s| s.depends_on.is_empty() && s.status == StepStatus::Pending) {
            self.queue
                .enqueue(run.id, QueueType::ExecuteStep, Some(step.id), item.priority, step.max_attempts, None)
                .await?;
        }
        if run.status == RunStatus::Pending {
            self.store.update_run_status(run.id, RunStatus::Running, None, None).await?;
        }
        self.queue.complete(item.id, worker_id).await?;
        Ok(StepOutcome::StartDispatched)
    }

    async fn dispatch_retry_step(&self, claimed: &ClaimedQueueItem, worker_id: &str) -> Result<StepOutcome, EngineError> {
        let item = &claimed.item;
        let step_id = item.payload.step_id.ok_or(EngineError::MissingStepId(item.id))?;
        let step = self.store.reset_step_for_retry(step_id).await?;
        self.queue
            .enqueue(step.run_id, QueueType::ExecuteStep, Some(step.id), item.priority, step.max_attempts, None)
            .await?;
        self.queue.complete(item.id, worker_id).await?;
        Ok(StepOutcome::RetryDispatched)
    }

    async fn process_recover_run(&self, claimed: &ClaimedQueueItem, worker_id: &str) -> Result<StepOutcome, EngineError> {
        let item = &claimed.item;
        let run = self.store.get_run(item.run_id).await?;
        if !run.status.is_terminal() {
            let started = run.started_at.unwrap_or(run.created_at);
            let elapsed = Utc::now().signed_duration_since(started).num_seconds().max(0) as u64;
            if elapsed >= run.timeout_seconds {
                self.store.cancel_run_queue_items(run.id).await?;
                let result = self
                    .store
                    .update_run_status(run.id, RunStatus::Failed, None, Some(ErrorDetails::permanent("run timed out")))
                    .await;
                match result {
                    Ok(_) | Err(StoreError::InvalidRunTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                warn!(run_id = %run.id, elapsed_s = elapsed, timeout_s = run.timeout_seconds, "run timed out");
            }
        }
        self.queue.complete(item.id, worker_id).await?;
        Ok(StepOutcome::TimeoutChecked)
    }

    /// §4.D ExecuteStep, the core of the engine: prepares the step (run
    /// status check, merged input, pre-execute checkpoint, mark
    /// running), invokes the node through this process's
    /// `NodeRegistry`, and applies the result. Split into
    /// `prepare_execute_step` / `report_step_result` so a remote worker
    /// that executes the node itself (§4.E, §6 `/workers` endpoints) can
    /// drive the same two halves over HTTP instead of in-process.
    pub async fn execute_step(&self, claimed: &ClaimedQueueItem, worker_id: &str) -> Result<StepOutcome, EngineError> {
        let prepared = match self.prepare_execute_step(claimed, worker_id).await? {
            ClaimPrepOutcome::Released(outcome) => return Ok(outcome),
            ClaimPrepOutcome::Ready(prepared) => prepared,
        };
        let run = self.store.get_run(prepared.step.run_id).await?;

        let node = match self.registry.get(&prepared.step.node_type) {
            Ok(node) => node,
            Err(err) => {
                return self
                    .handle_failure(&claimed.item, worker_id, &run, &prepared.step, ErrorDetails::permanent(err.to_string()))
                    .await;
            }
        };
        let result = self.invoke_node(node, &run, &prepared.step, prepared.input).await;
        self.report_step_result(claimed, worker_id, result.map_err(|e| e.details)).await
    }

    /// Steps 1-3 of ExecuteStep: release the item without touching a
    /// node if the run has moved on, otherwise build the merged input
    /// envelope, write the pre-execute checkpoint, and mark the step
    /// `running`. Exposed so a remote worker's `claim-work` call (§6)
    /// can fetch everything it needs to execute the node itself.
    pub async fn prepare_execute_step(&self, claimed: &ClaimedQueueItem, worker_id: &str) -> Result<ClaimPrepOutcome, EngineError> {
        let item = &claimed.item;
        let step_id = item.payload.step_id.ok_or(EngineError::MissingStepId(item.id))?;
        let step = self.store.get_step(step_id).await?;
        let run = self.store.get_run(step.run_id).await?;

        if run.status.is_terminal() {
            self.store.skip_step(step_id).await.ok();
            self.queue.complete(item.id, worker_id).await?;
            return Ok(ClaimPrepOutcome::Released(StepOutcome::Skipped));
        }
        if run.status == RunStatus::Paused {
            self.queue.complete(item.id, worker_id).await?;
            return Ok(ClaimPrepOutcome::Released(StepOutcome::RunNotRunning));
        }
        if run.status == RunStatus::Pending {
            self.store.update_run_status(run.id, RunStatus::Running, None, None).await?;
        }

        // A ForEach fan-out child's input is the single array element it
        // was created to process, fixed at creation time — never a merge
        // over predecessor outputs (there is exactly one predecessor, the
        // ForEach step itself, whose output is the whole array).
        let input = if step.group_id.is_some() {
            let mut preset = step
                .input
                .clone()
                .expect("fan-out child steps are created with their input envelope already set");
            preset.variables = run.variables.clone();
            preset
        } else {
            let mut predecessors = Vec::with_capacity(step.depends_on.len());
            for dep_id in &step.depends_on {
                predecessors.push(self.store.get_step(*dep_id).await?);
            }
            self.build_step_input(&step, &run, &predecessors)
        };

        self.store
            .write_checkpoint(NewCheckpoint {
                step_id,
                checkpoint_type: CheckpointType::PreExecute,
                variables: run.variables.clone(),
                envelope: Some(input.clone()),
            })
            .await?;

        let step = self.store.mark_step_running(step_id, worker_id, input.clone()).await?;
        Ok(ClaimPrepOutcome::Ready(PreparedStep { step, input }))
    }

    /// Step 4 of ExecuteStep, taking the node's result rather than
    /// invoking a node itself: applies `handle_success`/`handle_failure`
    /// against whatever a remote worker reports back to
    /// `/workers/{id}/complete-work` (§4.E, §6). `claimed` must be the
    /// same item `prepare_execute_step` returned `Ready` for.
    pub async fn report_step_result(
        &self,
        claimed: &ClaimedQueueItem,
        worker_id: &str,
        result: Result<NodeOutput, ErrorDetails>,
    ) -> Result<StepOutcome, EngineError> {
        let item = &claimed.item;
        let step_id = item.payload.step_id.ok_or(EngineError::MissingStepId(item.id))?;
        let step = self.store.get_step(step_id).await?;
        let run = self.store.get_run(step.run_id).await?;

        match result {
            Ok(output) => self.handle_success(item, worker_id, &run, &step, output).await,
            Err(details) => self.handle_failure(item, worker_id, &run, &step, details).await,
        }
    }

    fn build_step_input(&self, step: &WorkflowStep, run: &WorkflowRun, predecessors: &[WorkflowStep]) -> Envelope {
        let trace = Trace::new(run.workflow_id, run.id, step.node_id.clone(), step.step_number)
            .with_attempt(step.attempt + 1);
        let mut envelope = if predecessors.is_empty() {
            Envelope::new(run.input.data.clone(), trace)
        } else {
            let outputs: Vec<Envelope> = predecessors.iter().filter_map(|s| s.output.clone()).collect();
            Envelope::merge(&outputs, trace)
        };
        envelope.variables = run.variables.clone();
        envelope
    }

    /// Runs the node on a separate task so a panicking node converts to
    /// a `Permanent` error (§4.C) instead of taking the worker process
    /// down with it.
    async fn invoke_node(
        &self,
        node: Arc<dyn crate::node::NodeRuntime>,
        run: &WorkflowRun,
        step: &WorkflowStep,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let ctx = ExecutionContext::new(
            run.id,
            step.id,
            step.node_id.clone(),
            step.attempt,
            step.max_attempts,
            run.variables.clone(),
            self.platform.clone(),
        );
        self.cancellations.insert(step.id, ctx.cancellation_handle());
        let platform = ctx.platform.clone();
        let config = step.node_config.clone();

        let outcome = tokio::spawn(async move { node.execute_envelope(&ctx, &config, input).await }).await;
        self.cancellations.remove(&step.id);
        let mutations = platform.take_mutations();

        match outcome {
            Ok(Ok(mut output)) => {
                if !mutations.is_empty() {
                    output.variables_patch = mutations;
                }
                Ok(output)
            }
            Ok(Err(err)) => Err(err),
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                Err(NodeError { details: ErrorDetails::from_panic(payload.as_ref()) })
            }
            Err(join_err) => Err(NodeError { details: ErrorDetails::retryable(format!("node task did not complete: {join_err}")) }),
        }
    }

    async fn handle_success(
        &self,
        item: &crate::model::QueueItem,
        worker_id: &str,
        run: &WorkflowRun,
        step: &WorkflowStep,
        output: NodeOutput,
    ) -> Result<StepOutcome, EngineError> {
        self.store
            .write_checkpoint(NewCheckpoint {
                step_id: step.id,
                checkpoint_type: CheckpointType::PostExecute,
                variables: run.variables.clone(),
                envelope: Some(output.envelope.clone()),
            })
            .await?;

        let edges = run.graph.successors_of(&step.node_id, output.handle.as_deref());
        let mut successors = Vec::with_capacity(edges.len());
        let mut fan_out = Vec::new();

        match &output.items {
            None => {
                for edge in &edges {
                    let target = run
                        .graph
                        .node(&edge.target)
                        .ok_or_else(|| EngineError::UnknownGraphNode(edge.target.clone()))?;
                    let depends_on_node_ids =
                        run.graph.predecessors_of(&edge.target).iter().map(|e| e.source.clone()).collect();
                    successors.push(SuccessorSpec {
                        target_node_id: edge.target.clone(),
                        target_node_type: target.node_type.clone(),
                        target_config: target.config.clone(),
                        target_max_attempts: run.retry_policy.max_attempts,
                        target_depends_on_node_ids: depends_on_node_ids,
                        priority: item.priority,
                        queue_max_attempts: run.retry_policy.max_attempts,
                        source_group_id: step.group_id,
                    });
                }
            }
            Some(items) if !items.is_empty() => {
                // ForEach fan-out: one sibling child step per element of
                // every "each"-handled edge's target, all sharing one
                // group id so the target's own downstream successor can
                // later resolve "have every sibling finished" by group
                // rather than by a single step id (§4.D).
                for edge in &edges {
                    let target = run
                        .graph
                        .node(&edge.target)
                        .ok_or_else(|| EngineError::UnknownGraphNode(edge.target.clone()))?;
                    for element in items {
                        fan_out.push(FanOutChild {
                            node_id: edge.target.clone(),
                            node_type: target.node_type.clone(),
                            config: target.config.clone(),
                            input: element.clone(),
                            max_attempts: run.retry_policy.max_attempts,
                            priority: item.priority,
                            queue_max_attempts: run.retry_policy.max_attempts,
                        });
                    }
                }
            }
            Some(_empty) => {
                // Nothing to fan out over: the edge's target never runs,
                // so route directly to its own successors instead of
                // leaving them waiting on a step that will never exist.
                // Only handles one level of skip-ahead (ForEach -> body
                // -> join); a body with its own further fan-out is not
                // specially unwound.
                for edge in &edges {
                    let grandchildren = run.graph.successors_of(&edge.target, None);
                    for gedge in &grandchildren {
                        let gtarget = run
                            .graph
                            .node(&gedge.target)
                            .ok_or_else(|| EngineError::UnknownGraphNode(gedge.target.clone()))?;
                        let depends_on_node_ids = run
                            .graph
                            .predecessors_of(&gedge.target)
                            .iter()
                            .map(|e| if e.source == edge.target { step.node_id.clone() } else { e.source.clone() })
                            .collect();
                        successors.push(SuccessorSpec {
                            target_node_id: gedge.target.clone(),
                            target_node_type: gtarget.node_type.clone(),
                            target_config: gtarget.config.clone(),
                            target_max_attempts: run.retry_policy.max_attempts,
                            target_depends_on_node_ids: depends_on_node_ids,
                            priority: item.priority,
                            queue_max_attempts: run.retry_policy.max_attempts,
                            source_group_id: step.group_id,
                        });
                    }
                }
            }
        }

        let run_terminal =
            (successors.is_empty() && fan_out.is_empty()).then(|| (RunStatus::Completed, Some(output.envelope.clone()), None));
        self.store
            .complete_step_and_advance(
                step.id,
                output.envelope,
                Advance { successors, fan_out, variables_patch: output.variables_patch, run_terminal },
            )
            .await?;
        self.queue.complete(item.id, worker_id).await?;
        debug!(run_id = %run.id, step_id = %step.id, node_id = %step.node_id, "step completed");
        Ok(StepOutcome::Completed)
    }

    /// §7: applies the error taxonomy's engine response. A `Retryable`
    /// or lease-`Timeout` failure retries while `run.retry_policy` has
    /// attempts left; everything else (including a `Retryable` that has
    /// exhausted its attempts, which the table calls "promote to
    /// `Permanent`") fails the step and, absent any recovery branch,
    /// fails the run.
    async fn handle_failure(
        &self,
        item: &crate::model::QueueItem,
        worker_id: &str,
        run: &WorkflowRun,
        step: &WorkflowStep,
        details: ErrorDetails,
    ) -> Result<StepOutcome, EngineError> {
        match details.kind {
            ErrorKind::UserInput => {
                self.store.suspend_step(step.id, details.clone()).await?;
                self.store
                    .write_checkpoint(NewCheckpoint {
                        step_id: step.id,
                        checkpoint_type: CheckpointType::UserSuspend,
                        variables: run.variables.clone(),
                        envelope: step.input.clone(),
                    })
                    .await?;
                self.queue.complete(item.id, worker_id).await?;
                Ok(StepOutcome::Suspended)
            }
            ErrorKind::Cancelled => {
                self.store.skip_step(step.id).await?;
                self.queue.complete(item.id, worker_id).await?;
                Ok(StepOutcome::Skipped)
            }
            ErrorKind::Retryable | ErrorKind::Timeout if run.retry_policy.has_attempts_remaining(step.attempt) => {
                self.store.mark_step_pending_for_retry(step.id).await?;
                self.queue.fail(item.id, worker_id, &details.message, step.attempt, &run.retry_policy).await?;
                warn!(run_id = %run.id, step_id = %step.id, attempt = step.attempt, "step failed, retrying");
                Ok(StepOutcome::Retrying)
            }
            _ => {
                let promoted = if details.kind == ErrorKind::Retryable {
                    ErrorDetails { kind: ErrorKind::Permanent, ..details }
                } else {
                    details
                };
                self.store.fail_step(step.id, promoted.clone()).await?;
                self.queue.complete(item.id, worker_id).await?;
                self.store.cancel_run_queue_items(run.id).await?;
                let result = self.store.update_run_status(run.id, RunStatus::Failed, None, Some(promoted)).await;
                match result {
                    Ok(_) | Err(StoreError::InvalidRunTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                warn!(run_id = %run.id, step_id = %step.id, "step failed permanently, run failed");
                Ok(StepOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::model::{GraphEdge, GraphNode};
    use crate::node::builtin::{ForEachNode, IfNode, MergeNode, PassthroughNode, StartNode};
    use crate::node::platform::RecordingPlatform;
    use crate::persistence::InMemoryStateStore;

    fn engine() -> ExecutionEngine<InMemoryStateStore> {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = Arc::new(
            NodeRegistry::builder()
                .register(StartNode)
                .unwrap()
                .register(PassthroughNode)
                .unwrap()
                .register(IfNode)
                .unwrap()
                .build(),
        );
        let platform: Arc<dyn Platform> = Arc::new(RecordingPlatform::new());
        ExecutionEngine::new(store, registry, platform, Config::default())
    }

    fn foreach_engine() -> ExecutionEngine<InMemoryStateStore> {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = Arc::new(
            NodeRegistry::builder()
                .register(StartNode)
                .unwrap()
                .register(PassthroughNode)
                .unwrap()
                .register(ForEachNode)
                .unwrap()
                .register(MergeNode)
                .unwrap()
                .build(),
        );
        let platform: Arc<dyn Platform> = Arc::new(RecordingPlatform::new());
        ExecutionEngine::new(store, registry, platform, Config::default())
    }

    fn foreach_graph() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                GraphNode { id: "start".into(), node_type: "start".into(), config: Value::Null },
                GraphNode {
                    id: "each".into(),
                    node_type: "for_each".into(),
                    config: serde_json::json!({"items_field": "items"}),
                },
                GraphNode { id: "body".into(), node_type: "noop".into(), config: Value::Null },
                GraphNode { id: "join".into(), node_type: "merge".into(), config: Value::Null },
            ],
            edges: vec![
                GraphEdge { id: "e1".into(), source: "start".into(), source_handle: None, target: "each".into(), target_handle: None },
                GraphEdge {
                    id: "e2".into(),
                    source: "each".into(),
                    source_handle: Some("each".into()),
                    target: "body".into(),
                    target_handle: None,
                },
                GraphEdge { id: "e3".into(), source: "body".into(), source_handle: None, target: "join".into(), target_handle: None },
            ],
        }
    }

    /// Sets a durable run variable via `ctx.platform.set_variable`.
    struct SetVarNode;

    #[async_trait]
    impl crate::node::NodeRuntime for SetVarNode {
        fn meta(&self) -> crate::node::NodeMeta {
            crate::node::NodeMeta::new("set_var", "Set Variable")
        }

        async fn execute_envelope(
            &self,
            ctx: &ExecutionContext,
            _config: &Value,
            input: Envelope,
        ) -> Result<NodeOutput, NodeError> {
            ctx.platform.set_variable("greeting", serde_json::json!("hi"));
            Ok(NodeOutput::new(input))
        }
    }

    /// Echoes the run variable `greeting` into its output for assertions.
    struct ReadVarNode;

    #[async_trait]
    impl crate::node::NodeRuntime for ReadVarNode {
        fn meta(&self) -> crate::node::NodeMeta {
            crate::node::NodeMeta::new("read_var", "Read Variable")
        }

        async fn execute_envelope(
            &self,
            ctx: &ExecutionContext,
            _config: &Value,
            mut input: Envelope,
        ) -> Result<NodeOutput, NodeError> {
            input.data = serde_json::json!({ "seen": ctx.variables.get("greeting").cloned() });
            Ok(NodeOutput::new(input))
        }
    }

    async fn drain(engine: &ExecutionEngine<InMemoryStateStore>) {
        loop {
            let claimed = engine
                .queue
                .claim("w1", &[QueueType::StartRun, QueueType::ExecuteStep], 10)
                .await
                .unwrap();
            if claimed.is_empty() {
                break;
            }
            for item in &claimed {
                engine.process(item, "w1").await.unwrap();
            }
        }
    }

    fn linear_graph() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                GraphNode { id: "start".into(), node_type: "start".into(), config: Value::Null },
                GraphNode { id: "middle".into(), node_type: "noop".into(), config: Value::Null },
            ],
            edges: vec![GraphEdge { id: "e1".into(), source: "start".into(), source_handle: None, target: "middle".into(), target_handle: None }],
        }
    }

    fn spec(graph: WorkflowGraph) -> StartRunSpec {
        StartRunSpec {
            workflow_id: Uuid::now_v7(),
            version_id: Uuid::now_v7(),
            trigger_id: None,
            graph,
            input: serde_json::json!({"n": 1}),
            variables: serde_json::Map::new(),
            timeout_seconds: None,
            retry_policy: None,
            priority: 0,
        }
    }

    #[tokio::test]
    async fn start_run_persists_pending_run_and_queues_start_item() {
        let engine = engine();
        let run = engine.start_run(spec(linear_graph())).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        let claimed = engine.queue.claim("w1", &[QueueType::StartRun], 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn full_linear_run_reaches_completed() {
        let engine = engine();
        let run = engine.start_run(spec(linear_graph())).await.unwrap();

        loop {
            let claimed = engine
                .queue
                .claim("w1", &[QueueType::StartRun, QueueType::ExecuteStep], 10)
                .await
                .unwrap();
            if claimed.is_empty() {
                break;
            }
            for item in &claimed {
                engine.process(item, "w1").await.unwrap();
            }
        }

        let finished = engine.store.get_run(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.completed_steps, 2);
    }

    #[tokio::test]
    async fn pause_then_resume_releases_step_without_executing() {
        let engine = engine();
        let run = engine.start_run(spec(linear_graph())).await.unwrap();

        let start_items = engine.queue.claim("w1", &[QueueType::StartRun], 10).await.unwrap();
        engine.process(&start_items[0], "w1").await.unwrap();

        engine.pause_run(run.id).await.unwrap();
        let claimed = engine.queue.claim("w1", &[QueueType::ExecuteStep], 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let outcome = engine.execute_step(&claimed[0], "w1").await.unwrap();
        assert_eq!(outcome, StepOutcome::RunNotRunning);

        let paused = engine.store.get_run(run.id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);

        engine.resume_run(run.id).await.unwrap();
        let reclaimed = engine.queue.claim("w2", &[QueueType::ExecuteStep], 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn cancel_run_drops_pending_steps_and_unclaimed_items() {
        let engine = engine();
        let run = engine.start_run(spec(linear_graph())).await.unwrap();

        engine.cancel_run(run.id).await.unwrap();
        let cancelled = engine.store.get_run(run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        let claimed = engine
            .queue
            .claim("w1", &[QueueType::StartRun, QueueType::ExecuteStep], 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn cycle_is_rejected_at_start_run() {
        let engine = engine();
        let graph = WorkflowGraph {
            nodes: vec![
                GraphNode { id: "a".into(), node_type: "noop".into(), config: Value::Null },
                GraphNode { id: "b".into(), node_type: "noop".into(), config: Value::Null },
            ],
            edges: vec![
                GraphEdge { id: "e1".into(), source: "a".into(), source_handle: None, target: "b".into(), target_handle: None },
                GraphEdge { id: "e2".into(), source: "b".into(), source_handle: None, target: "a".into(), target_handle: None },
            ],
        };
        let result = engine.start_run(spec(graph)).await;
        assert!(matches!(result, Err(EngineError::Graph(_))));
    }

    #[tokio::test]
    async fn for_each_fans_out_one_sibling_step_per_element_and_joins() {
        let engine = foreach_engine();
        let mut run_spec = spec(foreach_graph());
        run_spec.input = serde_json::json!({"items": [{"v": 1}, {"v": 2}, {"v": 3}]});
        let run = engine.start_run(run_spec).await.unwrap();

        drain(&engine).await;

        let finished = engine.store.get_run(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);

        let steps = engine.store.list_steps_for_run(run.id).await.unwrap();
        let body_steps: Vec<_> = steps.iter().filter(|s| s.node_id == "body").collect();
        assert_eq!(body_steps.len(), 3);
        assert!(body_steps.iter().all(|s| s.status == StepStatus::Completed));
        let group_id = body_steps[0].group_id.expect("fan-out child carries a group id");
        assert!(body_steps.iter().all(|s| s.group_id == Some(group_id)));
        let values: std::collections::BTreeSet<i64> =
            body_steps.iter().map(|s| s.output.as_ref().unwrap().data["v"].as_i64().unwrap()).collect();
        assert_eq!(values, [1, 2, 3].into_iter().collect());

        let join = steps.iter().find(|s| s.node_id == "join").unwrap();
        assert_eq!(join.status, StepStatus::Completed);
        assert_eq!(join.depends_on.len(), 3);
    }

    #[tokio::test]
    async fn for_each_over_empty_array_skips_straight_to_join() {
        let engine = foreach_engine();
        let mut run_spec = spec(foreach_graph());
        run_spec.input = serde_json::json!({"items": []});
        let run = engine.start_run(run_spec).await.unwrap();

        drain(&engine).await;

        let finished = engine.store.get_run(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);

        let steps = engine.store.list_steps_for_run(run.id).await.unwrap();
        assert!(steps.iter().all(|s| s.node_id != "body"));
        let join = steps.iter().find(|s| s.node_id == "join").unwrap();
        assert_eq!(join.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn set_variable_is_durable_and_visible_to_the_next_step() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = Arc::new(
            NodeRegistry::builder()
                .register(StartNode)
                .unwrap()
                .register(SetVarNode)
                .unwrap()
                .register(ReadVarNode)
                .unwrap()
                .build(),
        );
        let platform: Arc<dyn Platform> = Arc::new(RecordingPlatform::new());
        let engine = ExecutionEngine::new(store, registry, platform, Config::default());

        let graph = WorkflowGraph {
            nodes: vec![
                GraphNode { id: "start".into(), node_type: "start".into(), config: Value::Null },
                GraphNode { id: "set".into(), node_type: "set_var".into(), config: Value::Null },
                GraphNode { id: "read".into(), node_type: "read_var".into(), config: Value::Null },
            ],
            edges: vec![
                GraphEdge { id: "e1".into(), source: "start".into(), source_handle: None, target: "set".into(), target_handle: None },
                GraphEdge { id: "e2".into(), source: "set".into(), source_handle: None, target: "read".into(), target_handle: None },
            ],
        };
        let run = engine.start_run(spec(graph)).await.unwrap();
        drain(&engine).await;

        let finished = engine.store.get_run(run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.variables.get("greeting"), Some(&serde_json::json!("hi")));
        assert_eq!(finished.output.unwrap().data["seen"], serde_json::json!("hi"));
    }
}
