//! `StateStore`: the durable system of record for runs, steps, the
//! work queue, workers, checkpoints, and dead-lettered queue items
//! (§3, §4.A). Consistency is expected to come from a single
//! relational store with row-level locks; `Claim` and
//! `CompleteStepAndAdvance` are the two operations the engine needs
//! as atomic multi-row transactions — everything else is ordinary CRUD.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    Checkpoint, DeadLetterEntry, DeadLetterFilter, Envelope, ErrorDetails, NewCheckpoint, NewQueueItem,
    NewRun, NewStep, QueueFailureOutcome, QueueItem, QueueType, RunFilter, RunStatus, WorkerFilter,
    WorkerRecord, WorkflowRun, WorkflowStep,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("queue item not found: {0}")]
    QueueItemNotFound(Uuid),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("claim on {item_id} held by a different worker, or already expired")]
    ClaimNotHeld { item_id: Uuid },

    #[error("invalid run status transition: {from} -> {to}")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A queue item claimed for execution, annotated with the lease that
/// was just granted (§4.A Claim: "sets `claimed_by`, `claim_expires_at`
/// ... returns them").
#[derive(Debug, Clone)]
pub struct ClaimedQueueItem {
    pub item: QueueItem,
}

/// One outgoing edge from the step that just completed, naming the
/// target node it reaches and everything the store needs to get-or-create
/// that target's step row and decide whether it is now ready to run
/// (§4.D "ensure target step exists... enqueue `execute_step` if all
/// dependencies satisfied").
///
/// Resolving *whether all dependencies are satisfied* happens inside the
/// store's transaction rather than in the engine: the target's
/// depends_on set is itself graph-derived (`target_depends_on_node_ids`),
/// but the readiness check needs the live status of those steps, and
/// that status can change concurrently when a sibling branch completes
/// at the same time (§8 boundary scenario 3, fan-out/fan-in). Letting
/// the engine read statuses, decide, then tell the store what to write
/// reopens exactly the race the store's transaction is supposed to
/// close.
#[derive(Debug, Clone)]
pub struct SuccessorSpec {
    pub target_node_id: String,
    pub target_node_type: String,
    pub target_config: Value,
    pub target_max_attempts: u32,
    /// Every predecessor node id of the target in the graph — not just
    /// this edge's source. The store resolves these to step ids (they
    /// must already exist: a node's predecessors' steps are created no
    /// later than the node's own step) to populate the target's
    /// `depends_on` the first time it is created, and to check
    /// readiness on every subsequent call that reaches the same target.
    pub target_depends_on_node_ids: Vec<String>,
    pub priority: i32,
    pub queue_max_attempts: u32,
    /// The completing step's own `group_id`, if it is itself a ForEach
    /// fan-out child. Propagated so a chain of fan-out -> passthrough ->
    /// merge still resolves the merge's dependencies by group rather
    /// than by a single node id (§4.D).
    pub source_group_id: Option<Uuid>,
}

/// One ForEach fan-out child to create alongside the completing step
/// (§4.D "ForEach is implemented as the engine creating one child step
/// per element with a shared parent group id"). Every child shares
/// `group_id` and depends only on the ForEach step itself — they run
/// independently of one another.
#[derive(Debug, Clone)]
pub struct FanOutChild {
    pub node_id: String,
    pub node_type: String,
    pub config: Value,
    pub input: Value,
    pub max_attempts: u32,
    pub priority: i32,
    pub queue_max_attempts: u32,
}

/// What `complete_step_and_advance` should do besides marking the
/// completing step itself done (§4.A operation 2): walk the completing
/// node's outgoing edges (already filtered by emitted handle) and, for
/// each, get-or-create the target step and enqueue it once all of its
/// dependencies are satisfied — or, if the step had no successors at
/// all, transition the run to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct Advance {
    pub successors: Vec<SuccessorSpec>,
    /// ForEach fan-out children to create instead of (not in addition
    /// to) `successors` when the completing node emitted `items`.
    pub fan_out: Vec<FanOutChild>,
    /// Run-variable mutations to merge into `workflow_runs.variables`
    /// in this same transaction, last-writer-wins per key (§5).
    pub variables_patch: serde_json::Map<String, Value>,
    /// Set when this step had no successors and the run should
    /// transition to a terminal state (§4.D "If no successors, mark
    /// run `completed` with output = this step's output").
    pub run_terminal: Option<(RunStatus, Option<Envelope>, Option<ErrorDetails>)>,
}

/// The durable system of record (§3, §4.A). Implementations must be
/// `Send + Sync` and safe under concurrent access from many worker
/// processes; the in-memory implementation uses a single mutex for
/// everything, the Postgres implementation relies on row-level locks
/// and `SELECT ... FOR UPDATE SKIP LOCKED`.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // -- Runs ----------------------------------------------------------

    async fn create_run(&self, run: NewRun) -> Result<WorkflowRun, StoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;
    async fn list_runs(&self, filter: RunFilter, offset: u32, limit: u32) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Transitions a run's status, enforcing that terminal statuses are
    /// absorbing and setting `completed_at` iff the new status is
    /// terminal (§3 WorkflowRun invariants).
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Envelope>,
        error: Option<ErrorDetails>,
    ) -> Result<WorkflowRun, StoreError>;

    // -- Steps -----------------------------------------------------------

    async fn create_steps(&self, steps: Vec<NewStep>) -> Result<Vec<WorkflowStep>, StoreError>;
    async fn get_step(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError>;
    async fn list_steps_for_run(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError>;

    /// Marks a step `running`, attaches the worker id, and records the
    /// merged input envelope the engine built for it.
    async fn mark_step_running(
        &self,
        step_id: Uuid,
        worker_id: &str,
        input: Envelope,
    ) -> Result<WorkflowStep, StoreError>;

    /// §4.A operation 2: within one transaction, marks `step_id`
    /// completed with `output`, increments the owning run's counters,
    /// inserts `advance.new_steps`, enqueues `advance.enqueue` for
    /// whichever successors are now ready, and applies
    /// `advance.run_terminal` if this was the run's last step.
    async fn complete_step_and_advance(
        &self,
        step_id: Uuid,
        output: Envelope,
        advance: Advance,
    ) -> Result<WorkflowStep, StoreError>;

    /// Marks a step `failed` with the given error, without touching
    /// retry scheduling (the Work Queue layer owns backoff).
    async fn fail_step(&self, step_id: Uuid, error: ErrorDetails) -> Result<WorkflowStep, StoreError>;

    /// Marks a step `skipped` (cancellation, or a branch not taken).
    async fn skip_step(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError>;

    /// Returns a step to `pending` after a transient (`Retryable`)
    /// failure with attempts remaining, without resetting `attempt` or
    /// `error` — distinct from `reset_step_for_retry`, which is the
    /// operator-facing `RetryStep` action on an already-`failed` step.
    async fn mark_step_pending_for_retry(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError>;

    /// Marks a step `suspended`, awaiting human action (§7 `UserInput`).
    async fn suspend_step(&self, step_id: Uuid, error: ErrorDetails) -> Result<WorkflowStep, StoreError>;

    /// Resets a `failed` step back to `pending` with `attempt` reset to
    /// zero, for `RetryStep` (§4.D).
    async fn reset_step_for_retry(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError>;

    // -- Queue -------------------------------------------------------------

    async fn enqueue(&self, item: NewQueueItem) -> Result<QueueItem, StoreError>;

    /// Reads a queue item by id regardless of claim state — used to
    /// resolve the step a remote worker's `/complete-work/{item_id}`
    /// call refers to, since that call carries only the item id.
    async fn get_queue_item(&self, item_id: Uuid) -> Result<QueueItem, StoreError>;

    /// §4.A operation 1: selects up to `limit` items where
    /// `available_at <= now()`, `claimed_by IS NULL`, `queue_type` in
    /// `capabilities`, ordered by `(priority desc, available_at asc)`;
    /// atomically claims and returns them.
    async fn claim(
        &self,
        worker_id: &str,
        capabilities: &[QueueType],
        limit: u32,
    ) -> Result<Vec<ClaimedQueueItem>, StoreError>;

    async fn extend_lease(&self, item_id: Uuid, worker_id: &str, extra_lease: Duration) -> Result<(), StoreError>;

    /// Deletes the queue item on success. Rejects if `worker_id` does
    /// not hold an unexpired lease on it (§4.E "the engine rejects
    /// completions for expired leases").
    async fn complete_queue_item(&self, item_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Either requeues with backoff (attempts remain) or moves to the
    /// dead-letter table, per `retry_policy`.
    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<QueueFailureOutcome, StoreError>;

    /// Returns items whose `claim_expires_at < now()` to the unclaimed
    /// pool, incrementing their attempt count (§4.B RecoverOrphaned).
    async fn recover_orphaned(&self) -> Result<Vec<QueueItem>, StoreError>;

    /// Deletes every unclaimed queue item belonging to `run_id` — used by
    /// `CancelRun` to satisfy "terminal run ⇒ no unclaimed queue items
    /// remain" (§8) without waiting for each item to be claimed and
    /// dropped one at a time. Claimed items are left alone; they either
    /// finish and hit the terminal-run check in `ExecuteStep`, or their
    /// lease expires and `recover_orphaned` puts them back in front of
    /// the same check.
    async fn cancel_run_queue_items(&self, run_id: Uuid) -> Result<(), StoreError>;

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    // -- Workers -------------------------------------------------------------

    /// Upsert semantics: re-registering an id preserves it and updates
    /// attributes (§4.E, §8 "idempotent register").
    async fn register_worker(&self, worker: WorkerRecord) -> Result<WorkerRecord, StoreError>;

    async fn heartbeat_worker(&self, worker_id: &str, current_step_count: u32) -> Result<(), StoreError>;

    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerRecord>, StoreError>;

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Marks workers whose `last_heartbeat_at` is older than `timeout`
    /// as `dead`; their claimed queue items become reclaimable on the
    /// next `recover_orphaned` once the lease itself expires.
    async fn reap_stale_workers(&self, timeout: Duration) -> Result<Vec<String>, StoreError>;

    // -- Checkpoints -------------------------------------------------------------

    async fn write_checkpoint(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, StoreError>;
    async fn list_checkpoints_for_step(&self, step_id: Uuid) -> Result<Vec<Checkpoint>, StoreError>;

    // -- Events (append-only, observability only; §6 `workflow_events`) ----

    /// Append a lightweight, non-authoritative event to the run's
    /// event stream — never consulted to reconstruct state, unlike an
    /// event-sourced store; purely for operator-facing history.
    async fn append_event(&self, run_id: Uuid, event_type: &str, payload: Value) -> Result<(), StoreError>;
}
