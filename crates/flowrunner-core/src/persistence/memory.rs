//! In-memory `StateStore`, primarily for tests and single-process
//! deployments. A single mutex guards all tables so the two atomic
//! operations the engine depends on (`claim`, `complete_step_and_advance`)
//! are trivially transactional — the Postgres implementation gets the
//! same guarantee from row locks instead of a process-wide lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{
    Checkpoint, DeadLetterEntry, DeadLetterFilter, Envelope, ErrorDetails, NewCheckpoint, NewQueueItem,
    NewRun, NewStep, QueueFailureOutcome, QueueItem, QueuePayload, QueueType, RunFilter, RunStatus,
    StepStatus, WorkerFilter, WorkerRecord, WorkerStatus, WorkflowRun, WorkflowStep,
};

use super::store::{Advance, ClaimedQueueItem, StateStore, StoreError};
use crate::model::Trace;

struct Inner {
    runs: HashMap<Uuid, WorkflowRun>,
    steps: HashMap<Uuid, WorkflowStep>,
    queue: HashMap<Uuid, QueueItem>,
    workers: HashMap<String, WorkerRecord>,
    checkpoints: HashMap<Uuid, Vec<Checkpoint>>,
    dead_letters: HashMap<Uuid, DeadLetterEntry>,
    events: Vec<(Uuid, String, Value)>,
}

/// `StateStore` backed by in-process `HashMap`s behind a single mutex.
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                runs: HashMap::new(),
                steps: HashMap::new(),
                queue: HashMap::new(),
                workers: HashMap::new(),
                checkpoints: HashMap::new(),
                dead_letters: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    pub fn run_count(&self) -> usize {
        self.inner.lock().unwrap().runs.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_run(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun {
            id: new_run.id,
            workflow_id: new_run.workflow_id,
            version_id: new_run.version_id,
            trigger_id: new_run.trigger_id,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input: new_run.input,
            output: None,
            variables: new_run.variables,
            timeout_seconds: new_run.timeout_seconds,
            retry_policy: new_run.retry_policy,
            assigned_worker_id: None,
            worker_heartbeat_at: None,
            error: None,
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            graph: new_run.graph,
        };
        self.inner.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn list_runs(&self, filter: RunFilter, offset: u32, limit: u32) -> Result<Vec<WorkflowRun>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<WorkflowRun> = inner
            .runs
            .values()
            .filter(|r| filter.workflow_id.map(|id| id == r.workflow_id).unwrap_or(true))
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Envelope>,
        error: Option<ErrorDetails>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::InvalidRunTransition { from: run.status, to: status });
        }
        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        if output.is_some() {
            run.output = output;
        }
        if error.is_some() {
            run.error = error;
        }
        Ok(run.clone())
    }

    async fn create_steps(&self, new_steps: Vec<NewStep>) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut created = Vec::with_capacity(new_steps.len());
        for new_step in new_steps {
            let step = WorkflowStep {
                id: Uuid::now_v7(),
                run_id: new_step.run_id,
                node_id: new_step.node_id,
                node_type: new_step.node_type,
                step_number: new_step.step_number,
                status: StepStatus::Pending,
                attempt: 0,
                max_attempts: new_step.max_attempts,
                input: None,
                output: None,
                node_config: new_step.node_config,
                error: None,
                depends_on: new_step.depends_on,
                assigned_worker_id: None,
                next_retry_at: None,
                group_id: new_step.group_id,
            };
            if let Some(run) = inner.runs.get_mut(&step.run_id) {
                run.total_steps += 1;
            }
            inner.steps.insert(step.id, step.clone());
            created.push(step);
        }
        Ok(created)
    }

    async fn get_step(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .steps
            .get(&step_id)
            .cloned()
            .ok_or(StoreError::StepNotFound(step_id))
    }

    async fn list_steps_for_run(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut steps: Vec<WorkflowStep> = inner.steps.values().filter(|s| s.run_id == run_id).cloned().collect();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }

    async fn mark_step_running(
        &self,
        step_id: Uuid,
        worker_id: &str,
        input: Envelope,
    ) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Running;
        step.attempt += 1;
        step.assigned_worker_id = Some(worker_id.to_string());
        step.input = Some(input);
        Ok(step.clone())
    }

    async fn complete_step_and_advance(
        &self,
        step_id: Uuid,
        output: Envelope,
        advance: Advance,
    ) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let (run_id, completing_node_id, completing_group_id) = {
            let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
            step.status = StepStatus::Completed;
            step.output = Some(output);
            (step.run_id, step.node_id.clone(), step.group_id)
        };

        // The whole operation runs under `self.inner`'s single mutex, so
        // get-or-create-and-maybe-enqueue below is already atomic with
        // respect to a sibling branch completing concurrently — there is
        // no window in which two completions can both observe "not yet
        // created" or both observe "not yet ready" for the same target.
        for successor in advance.successors {
            let existing_id = inner
                .steps
                .values()
                .find(|s| s.run_id == run_id && s.node_id == successor.target_node_id)
                .map(|s| s.id);

            let target_id = match existing_id {
                Some(id) => id,
                None => {
                    let depends_on: Vec<Uuid> = successor
                        .target_depends_on_node_ids
                        .iter()
                        .flat_map(|node_id| {
                            // A predecessor node that the completing step
                            // fanned out over has one step per element,
                            // not one — resolve by the shared group id
                            // instead of by node id alone (§4.D).
                            if node_id == &completing_node_id {
                                if let Some(gid) = completing_group_id {
                                    return inner
                                        .steps
                                        .values()
                                        .filter(|s| s.run_id == run_id && &s.node_id == node_id && s.group_id == Some(gid))
                                        .map(|s| s.id)
                                        .collect::<Vec<_>>();
                                }
                            }
                            inner
                                .steps
                                .values()
                                .find(|s| s.run_id == run_id && &s.node_id == node_id)
                                .map(|s| s.id)
                                .into_iter()
                                .collect()
                        })
                        .collect();
                    let step_number = inner.steps.values().filter(|s| s.run_id == run_id).count() as u32 + 1;
                    let new_step = WorkflowStep {
                        id: Uuid::now_v7(),
                        run_id,
                        node_id: successor.target_node_id.clone(),
                        node_type: successor.target_node_type.clone(),
                        step_number,
                        status: StepStatus::Pending,
                        attempt: 0,
                        max_attempts: successor.target_max_attempts,
                        input: None,
                        output: None,
                        node_config: successor.target_config.clone(),
                        error: None,
                        depends_on,
                        assigned_worker_id: None,
                        next_retry_at: None,
                        group_id: None,
                    };
                    let id = new_step.id;
                    if let Some(run) = inner.runs.get_mut(&run_id) {
                        run.total_steps += 1;
                    }
                    inner.steps.insert(id, new_step);
                    id
                }
            };

            let target = inner.steps.get(&target_id).unwrap();
            let ready = target.status == StepStatus::Pending
                && target.depends_on.iter().all(|dep_id| {
                    inner
                        .steps
                        .get(dep_id)
                        .map(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
                        .unwrap_or(false)
                });

            if ready {
                let already_queued = inner
                    .queue
                    .values()
                    .any(|item| item.queue_type == QueueType::ExecuteStep && item.payload.step_id == Some(target_id));
                if !already_queued {
                    let item = QueueItem {
                        id: Uuid::now_v7(),
                        run_id,
                        queue_type: QueueType::ExecuteStep,
                        priority: successor.priority,
                        available_at: Utc::now(),
                        attempt: 0,
                        max_attempts: successor.queue_max_attempts,
                        payload: QueuePayload { run_id, step_id: Some(target_id) },
                        claimed_by: None,
                        claim_expires_at: None,
                    };
                    inner.queue.insert(item.id, item);
                }
            }
        }

        // ForEach fan-out: one child step per element, all sharing the
        // completing step's own id as their group id and depending only
        // on it — every sibling is ready the instant it is created.
        if !advance.fan_out.is_empty() {
            let agent_id = inner.runs.get(&run_id).map(|r| r.workflow_id).unwrap_or_default();
            let group_id = step_id;
            for child in advance.fan_out {
                let step_number = inner.steps.values().filter(|s| s.run_id == run_id).count() as u32 + 1;
                let trace = Trace::new(agent_id, run_id, child.node_id.clone(), step_number);
                let new_step = WorkflowStep {
                    id: Uuid::now_v7(),
                    run_id,
                    node_id: child.node_id,
                    node_type: child.node_type,
                    step_number,
                    status: StepStatus::Pending,
                    attempt: 0,
                    max_attempts: child.max_attempts,
                    input: Some(Envelope::new(child.input, trace)),
                    output: None,
                    node_config: child.config,
                    error: None,
                    depends_on: vec![step_id],
                    assigned_worker_id: None,
                    next_retry_at: None,
                    group_id: Some(group_id),
                };
                let id = new_step.id;
                if let Some(run) = inner.runs.get_mut(&run_id) {
                    run.total_steps += 1;
                }
                inner.steps.insert(id, new_step);

                let item = QueueItem {
                    id: Uuid::now_v7(),
                    run_id,
                    queue_type: QueueType::ExecuteStep,
                    priority: child.priority,
                    available_at: Utc::now(),
                    attempt: 0,
                    max_attempts: child.queue_max_attempts,
                    payload: QueuePayload { run_id, step_id: Some(id) },
                    claimed_by: None,
                    claim_expires_at: None,
                };
                inner.queue.insert(item.id, item);
            }
        }

        if !advance.variables_patch.is_empty() {
            if let Some(run) = inner.runs.get_mut(&run_id) {
                for (key, value) in advance.variables_patch {
                    run.variables.insert(key, value);
                }
            }
        }

        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.completed_steps += 1;
        }

        if let Some((status, run_output, run_error)) = advance.run_terminal {
            if let Some(run) = inner.runs.get_mut(&run_id) {
                if !run.status.is_terminal() {
                    run.status = status;
                    run.completed_at = Some(Utc::now());
                    if run_output.is_some() {
                        run.output = run_output;
                    }
                    if run_error.is_some() {
                        run.error = run_error;
                    }
                }
            }
        }

        inner.steps.get(&step_id).cloned().ok_or(StoreError::StepNotFound(step_id))
    }

    async fn fail_step(&self, step_id: Uuid, error: ErrorDetails) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let run_id = {
            let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
            step.status = StepStatus::Failed;
            step.error = Some(error);
            step.run_id
        };
        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.failed_steps += 1;
        }
        inner.steps.get(&step_id).cloned().ok_or(StoreError::StepNotFound(step_id))
    }

    async fn skip_step(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Skipped;
        Ok(step.clone())
    }

    async fn mark_step_pending_for_retry(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Pending;
        step.assigned_worker_id = None;
        Ok(step.clone())
    }

    async fn suspend_step(&self, step_id: Uuid, error: ErrorDetails) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
        step.status = StepStatus::Suspended;
        step.error = Some(error);
        Ok(step.clone())
    }

    async fn reset_step_for_retry(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.steps.get_mut(&step_id).ok_or(StoreError::StepNotFound(step_id))?;
        if step.status != StepStatus::Failed {
            return Err(StoreError::Database(format!(
                "step {step_id} is {} , RetryStep only applies to failed steps",
                step.status
            )));
        }
        step.status = StepStatus::Pending;
        step.attempt = 0;
        step.error = None;
        step.next_retry_at = None;
        Ok(step.clone())
    }

    async fn enqueue(&self, new_item: NewQueueItem) -> Result<QueueItem, StoreError> {
        let item = QueueItem {
            id: Uuid::now_v7(),
            run_id: new_item.run_id,
            queue_type: new_item.queue_type,
            priority: new_item.priority,
            available_at: new_item.available_at,
            attempt: 0,
            max_attempts: new_item.max_attempts,
            payload: new_item.payload,
            claimed_by: None,
            claim_expires_at: None,
        };
        self.inner.lock().unwrap().queue.insert(item.id, item.clone());
        Ok(item)
    }

    async fn claim(
        &self,
        worker_id: &str,
        capabilities: &[QueueType],
        limit: u32,
    ) -> Result<Vec<ClaimedQueueItem>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let lease = Duration::from_millis(120_000);

        let mut candidates: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|item| item.available_at <= now)
            .filter(|item| item.claimed_by.is_none() || item.claim_expires_at.map(|e| e <= now).unwrap_or(true))
            .filter(|item| capabilities.contains(&item.queue_type))
            .map(|item| item.id)
            .collect();

        candidates.sort_by(|a, b| {
            let ia = &inner.queue[a];
            let ib = &inner.queue[b];
            ib.priority.cmp(&ia.priority).then(ia.available_at.cmp(&ib.available_at))
        });
        candidates.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let item = inner.queue.get_mut(&id).unwrap();
            item.claimed_by = Some(worker_id.to_string());
            item.claim_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap());
            claimed.push(ClaimedQueueItem { item: item.clone() });
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, item_id: Uuid, worker_id: &str, extra_lease: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.queue.get_mut(&item_id).ok_or(StoreError::QueueItemNotFound(item_id))?;
        if item.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimNotHeld { item_id });
        }
        let extension = chrono::Duration::from_std(extra_lease).unwrap_or(chrono::Duration::zero());
        item.claim_expires_at = Some(item.claim_expires_at.unwrap_or_else(Utc::now) + extension);
        Ok(())
    }

    async fn complete_queue_item(&self, item_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.queue.get(&item_id).ok_or(StoreError::QueueItemNotFound(item_id))?;
        if item.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimNotHeld { item_id });
        }
        inner.queue.remove(&item_id);
        Ok(())
    }

    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        next_available_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<QueueFailureOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.queue.get(&item_id).ok_or(StoreError::QueueItemNotFound(item_id))?;
        if item.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimNotHeld { item_id });
        }

        if item.attempt + 1 < item.max_attempts {
            let item = inner.queue.get_mut(&item_id).unwrap();
            item.attempt += 1;
            item.claimed_by = None;
            item.claim_expires_at = None;
            item.available_at = next_available_at.unwrap_or_else(Utc::now);
            Ok(QueueFailureOutcome::Requeued { next_attempt: item.attempt, available_at: item.available_at })
        } else {
            let item = inner.queue.remove(&item_id).unwrap();
            let entry = DeadLetterEntry {
                id: Uuid::now_v7(),
                queue_item_id: item_id,
                run_id: item.run_id,
                queue_type: item.queue_type,
                payload: item.payload,
                error: error.to_string(),
                attempts: item.attempt + 1,
                moved_at: Utc::now(),
            };
            inner.dead_letters.insert(entry.id, entry);
            Ok(QueueFailureOutcome::DeadLettered)
        }
    }

    async fn recover_orphaned(&self) -> Result<Vec<QueueItem>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stale: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|item| item.claimed_by.is_some() && item.claim_expires_at.map(|e| e < now).unwrap_or(false))
            .map(|item| item.id)
            .collect();

        let mut recovered = Vec::with_capacity(stale.len());
        for id in stale {
            let item = inner.queue.get_mut(&id).unwrap();
            item.claimed_by = None;
            item.claim_expires_at = None;
            item.attempt += 1;
            recovered.push(item.clone());
        }
        Ok(recovered)
    }

    async fn cancel_run_queue_items(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|item| item.run_id == run_id && item.claimed_by.is_none())
            .map(|item| item.id)
            .collect();
        for id in doomed {
            inner.queue.remove(&id);
        }
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<DeadLetterEntry> = inner
            .dead_letters
            .values()
            .filter(|e| filter.run_id.map(|id| id == e.run_id).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));
        Ok(entries.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn register_worker(&self, worker: WorkerRecord) -> Result<WorkerRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.insert(worker.id.clone(), worker.clone());
        Ok(worker)
    }

    async fn heartbeat_worker(&self, worker_id: &str, current_step_count: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let worker = inner.workers.get_mut(worker_id).ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.last_heartbeat_at = Utc::now();
        worker.current_step_count = current_step_count;
        worker.status = if current_step_count > 0 { WorkerStatus::Busy } else { WorkerStatus::Idle };
        Ok(())
    }

    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .workers
            .values()
            .filter(|w| filter.status.map(|s| s == w.status).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().workers.remove(worker_id);
        Ok(())
    }

    async fn reap_stale_workers(&self, timeout: Duration) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let mut reaped = Vec::new();
        for worker in inner.workers.values_mut() {
            if worker.status != WorkerStatus::Dead && now - worker.last_heartbeat_at > threshold {
                worker.status = WorkerStatus::Dead;
                reaped.push(worker.id.clone());
            }
        }
        Ok(reaped)
    }

    async fn write_checkpoint(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        let record = Checkpoint {
            id: Uuid::now_v7(),
            step_id: checkpoint.step_id,
            checkpoint_type: checkpoint.checkpoint_type,
            created_at: Utc::now(),
            variables: checkpoint.variables,
            envelope: checkpoint.envelope,
        };
        self.inner.lock().unwrap().checkpoints.entry(record.step_id).or_default().push(record.clone());
        Ok(record)
    }

    async fn list_checkpoints_for_step(&self, step_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self.inner.lock().unwrap().checkpoints.get(&step_id).cloned().unwrap_or_default())
    }

    async fn append_event(&self, run_id: Uuid, event_type: &str, payload: Value) -> Result<(), StoreError> {
        self.inner.lock().unwrap().events.push((run_id, event_type.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QueuePayload, RetryPolicy, Trace, WorkflowGraph};

    fn sample_run() -> NewRun {
        let id = Uuid::now_v7();
        NewRun {
            id,
            workflow_id: Uuid::now_v7(),
            version_id: Uuid::now_v7(),
            trigger_id: None,
            input: Envelope::new(serde_json::json!({}), Trace::new(Uuid::now_v7(), id, "start", 1)),
            variables: serde_json::Map::new(),
            timeout_seconds: 3600,
            retry_policy: RetryPolicy::default(),
            priority: 0,
            graph: WorkflowGraph { nodes: vec![], edges: vec![] },
        }
    }

    #[tokio::test]
    async fn create_and_get_run_round_trips() {
        let store = InMemoryStateStore::new();
        let run = store.create_run(sample_run()).await.unwrap();
        let fetched = store.get_run(run.id).await.unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn claim_hides_unexpired_claims_from_other_workers() {
        let store = InMemoryStateStore::new();
        let run = store.create_run(sample_run()).await.unwrap();
        store
            .enqueue(NewQueueItem::now(
                run.id,
                QueueType::ExecuteStep,
                0,
                QueuePayload { run_id: run.id, step_id: None },
            ))
            .await
            .unwrap();

        let first = store.claim("worker-a", &[QueueType::ExecuteStep], 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.claim("worker-b", &[QueueType::ExecuteStep], 10).await.unwrap();
        assert!(second.is_empty(), "claimed item must be hidden from a second claimant");
    }

    #[tokio::test]
    async fn terminal_run_status_rejects_further_transitions() {
        let store = InMemoryStateStore::new();
        let run = store.create_run(sample_run()).await.unwrap();
        store.update_run_status(run.id, RunStatus::Completed, None, None).await.unwrap();
        let result = store.update_run_status(run.id, RunStatus::Running, None, None).await;
        assert!(matches!(result, Err(StoreError::InvalidRunTransition { .. })));
    }

    #[tokio::test]
    async fn fail_queue_item_dead_letters_after_max_attempts() {
        let store = InMemoryStateStore::new();
        let run = store.create_run(sample_run()).await.unwrap();
        let mut item = NewQueueItem::now(run.id, QueueType::ExecuteStep, 0, QueuePayload { run_id: run.id, step_id: None });
        item.max_attempts = 1;
        let item = store.enqueue(item).await.unwrap();
        store.claim("worker-a", &[QueueType::ExecuteStep], 10).await.unwrap();

        let outcome = store.fail_queue_item(item.id, "worker-a", "boom", None).await.unwrap();
        assert!(matches!(outcome, QueueFailureOutcome::DeadLettered));

        let dlq = store.list_dead_letters(DeadLetterFilter::default(), 0, 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
    }
}
