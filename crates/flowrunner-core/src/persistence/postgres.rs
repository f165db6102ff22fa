//! PostgreSQL `StateStore`: row-level locking via `FOR UPDATE` /
//! `FOR UPDATE SKIP LOCKED` stands in for the in-memory store's single
//! mutex. Queries are written against `sqlx::query` (runtime-checked)
//! rather than the `query!` macro so this file does not require a live
//! database at build time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{
    Checkpoint, CheckpointType, DeadLetterEntry, DeadLetterFilter, Envelope, ErrorDetails, NewCheckpoint,
    NewQueueItem, NewRun, NewStep, QueueFailureOutcome, QueueItem, QueueType, RunFilter, RunStatus, StepStatus,
    Trace, WorkerFilter, WorkerRecord, WorkerStatus, WorkflowRun, WorkflowStep,
};

use super::store::{Advance, ClaimedQueueItem, StateStore, StoreError};

/// PostgreSQL implementation of `StateStore`.
///
/// Backed by a connection pool; safe to share across worker tasks and
/// processes since consistency comes from the database, not process
/// memory.
///
/// ```ignore
/// use flowrunner_core::persistence::PostgresStateStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowrunner").await?;
/// let store = PostgresStateStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema migrations. Safe to call on every
    /// startup; `sqlx::migrate!` tracks what has already run.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus, StoreError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(StoreError::Database(format!("unknown run status {other:?}"))),
    }
}

fn step_status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
        StepStatus::Suspended => "suspended",
    }
}

fn parse_step_status(s: &str) -> Result<StepStatus, StoreError> {
    match s {
        "pending" => Ok(StepStatus::Pending),
        "running" => Ok(StepStatus::Running),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        "skipped" => Ok(StepStatus::Skipped),
        "suspended" => Ok(StepStatus::Suspended),
        other => Err(StoreError::Database(format!("unknown step status {other:?}"))),
    }
}

fn worker_status_str(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Idle => "idle",
        WorkerStatus::Busy => "busy",
        WorkerStatus::Draining => "draining",
        WorkerStatus::Dead => "dead",
    }
}

fn parse_worker_status(s: &str) -> Result<WorkerStatus, StoreError> {
    match s {
        "idle" => Ok(WorkerStatus::Idle),
        "busy" => Ok(WorkerStatus::Busy),
        "draining" => Ok(WorkerStatus::Draining),
        "dead" => Ok(WorkerStatus::Dead),
        other => Err(StoreError::Database(format!("unknown worker status {other:?}"))),
    }
}

fn checkpoint_type_str(kind: CheckpointType) -> &'static str {
    match kind {
        CheckpointType::PreExecute => "pre_execute",
        CheckpointType::PostExecute => "post_execute",
        CheckpointType::UserSuspend => "user_suspend",
    }
}

fn parse_checkpoint_type(s: &str) -> Result<CheckpointType, StoreError> {
    match s {
        "pre_execute" => Ok(CheckpointType::PreExecute),
        "post_execute" => Ok(CheckpointType::PostExecute),
        "user_suspend" => Ok(CheckpointType::UserSuspend),
        other => Err(StoreError::Database(format!("unknown checkpoint type {other:?}"))),
    }
}

fn queue_type_str(kind: QueueType) -> &'static str {
    kind.as_str()
}

fn parse_queue_type(s: &str) -> Result<QueueType, StoreError> {
    match s {
        "start_run" => Ok(QueueType::StartRun),
        "execute_step" => Ok(QueueType::ExecuteStep),
        "retry_step" => Ok(QueueType::RetryStep),
        "recover_run" => Ok(QueueType::RecoverRun),
        other => Err(StoreError::Database(format!("unknown queue type {other:?}"))),
    }
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<WorkflowRun, StoreError> {
    let status: String = row.get("status");
    let input: serde_json::Value = row.get("input");
    let output: Option<serde_json::Value> = row.get("output");
    let retry_policy: serde_json::Value = row.get("retry_policy");
    let error: Option<serde_json::Value> = row.get("error");
    Ok(WorkflowRun {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version_id: row.get("version_id"),
        trigger_id: row.get("trigger_id"),
        status: parse_run_status(&status)?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        input: from_json(input)?,
        output: output.map(from_json).transpose()?,
        variables: from_json(row.get("variables"))?,
        timeout_seconds: row.get::<i64, _>("timeout_seconds") as u64,
        retry_policy: from_json(retry_policy)?,
        assigned_worker_id: row.get("assigned_worker_id"),
        worker_heartbeat_at: row.get("worker_heartbeat_at"),
        error: error.map(from_json).transpose()?,
        total_steps: row.get::<i32, _>("total_steps") as u32,
        completed_steps: row.get::<i32, _>("completed_steps") as u32,
        failed_steps: row.get::<i32, _>("failed_steps") as u32,
        graph: from_json(row.get("graph"))?,
    })
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<WorkflowStep, StoreError> {
    let status: String = row.get("status");
    let input: Option<serde_json::Value> = row.get("input");
    let output: Option<serde_json::Value> = row.get("output");
    let error: Option<serde_json::Value> = row.get("error");
    let depends_on: Vec<Uuid> = row.get("depends_on");
    Ok(WorkflowStep {
        id: row.get("id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        step_number: row.get::<i32, _>("step_number") as u32,
        status: parse_step_status(&status)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        input: input.map(from_json).transpose()?,
        output: output.map(from_json).transpose()?,
        node_config: row.get("node_config"),
        error: error.map(from_json).transpose()?,
        depends_on,
        assigned_worker_id: row.get("assigned_worker_id"),
        next_retry_at: row.get("next_retry_at"),
        group_id: row.get("group_id"),
    })
}

fn row_to_queue_item(row: &sqlx::postgres::PgRow) -> Result<QueueItem, StoreError> {
    let queue_type: String = row.get("queue_type");
    let payload: serde_json::Value = row.get("payload");
    Ok(QueueItem {
        id: row.get("id"),
        run_id: row.get("run_id"),
        queue_type: parse_queue_type(&queue_type)?,
        priority: row.get("priority"),
        available_at: row.get("available_at"),
        attempt: row.get::<i32, _>("attempt") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        payload: from_json(payload)?,
        claimed_by: row.get("claimed_by"),
        claim_expires_at: row.get("claim_expires_at"),
    })
}

fn row_to_worker(row: &sqlx::postgres::PgRow) -> Result<WorkerRecord, StoreError> {
    let status: String = row.get("status");
    Ok(WorkerRecord {
        id: row.get("id"),
        hostname: row.get("hostname"),
        version: row.get("version"),
        capabilities: row.get("capabilities"),
        status: parse_worker_status(&status)?,
        last_heartbeat_at: row.get("last_heartbeat_at"),
        started_at: row.get("started_at"),
        max_concurrent_steps: row.get::<i32, _>("max_concurrent_steps") as u32,
        current_step_count: row.get::<i32, _>("current_step_count") as u32,
        lifetime_completed: row.get::<i64, _>("lifetime_completed") as u64,
        lifetime_failed: row.get::<i64, _>("lifetime_failed") as u64,
    })
}

#[async_trait]
impl StateStore for PostgresStateStore {
    #[instrument(skip(self, new_run))]
    async fn create_run(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let id = new_run.id;
        let input = to_json(&new_run.input)?;
        let variables = to_json(&new_run.variables)?;
        let retry_policy = to_json(&new_run.retry_policy)?;
        let graph = to_json(&new_run.graph)?;
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, version_id, trigger_id, status, created_at, input, graph, variables,
                 timeout_seconds, retry_policy, total_steps, completed_steps, failed_steps)
            VALUES ($1, $2, $3, $4, 'pending', NOW(), $5, $6, $7, $8, $9, 0, 0, 0)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_run.workflow_id)
        .bind(new_run.version_id)
        .bind(new_run.trigger_id)
        .bind(&input)
        .bind(&graph)
        .bind(&variables)
        .bind(new_run.timeout_seconds as i64)
        .bind(&retry_policy)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create run: {e}");
            StoreError::Database(e.to_string())
        })?;

        debug!(%id, "created run");
        row_to_run(&row)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::RunNotFound(run_id))?;
        row_to_run(&row)
    }

    async fn list_runs(&self, filter: RunFilter, offset: u32, limit: u32) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE ($1::uuid IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(filter.workflow_id)
        .bind(filter.status.map(run_status_str))
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_run).collect()
    }

    #[instrument(skip(self, output, error))]
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<Envelope>,
        error: Option<ErrorDetails>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let current = sqlx::query("SELECT status FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let current_status = parse_run_status(&current.get::<String, _>("status"))?;
        if current_status.is_terminal() {
            return Err(StoreError::InvalidRunTransition { from: current_status, to: status });
        }

        let output_json = output.map(|o| to_json(&o)).transpose()?;
        let error_json = error.map(|e| to_json(&e)).transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2,
                started_at = CASE WHEN $2 = 'running' AND started_at IS NULL THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW() ELSE completed_at END,
                output = COALESCE($3, output),
                error = COALESCE($4, error)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(run_status_str(status))
        .bind(&output_json)
        .bind(&error_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_run(&row)
    }

    async fn create_steps(&self, new_steps: Vec<NewStep>) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;
        let mut created = Vec::with_capacity(new_steps.len());
        for new_step in new_steps {
            let id = Uuid::now_v7();
            let row = sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (id, run_id, node_id, node_type, step_number, status, attempt, max_attempts,
                     node_config, depends_on, group_id)
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $9)
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(new_step.run_id)
            .bind(&new_step.node_id)
            .bind(&new_step.node_type)
            .bind(new_step.step_number as i32)
            .bind(new_step.max_attempts as i32)
            .bind(&new_step.node_config)
            .bind(&new_step.depends_on)
            .bind(new_step.group_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            sqlx::query("UPDATE workflow_runs SET total_steps = total_steps + 1 WHERE id = $1")
                .bind(new_step.run_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            created.push(row_to_step(&row)?);
        }
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(created)
    }

    async fn get_step(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::StepNotFound(step_id))?;
        row_to_step(&row)
    }

    async fn list_steps_for_run(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_steps WHERE run_id = $1 ORDER BY step_number")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_step).collect()
    }

    async fn mark_step_running(
        &self,
        step_id: Uuid,
        worker_id: &str,
        input: Envelope,
    ) -> Result<WorkflowStep, StoreError> {
        let input_json = to_json(&input)?;
        let row = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'running', attempt = attempt + 1, assigned_worker_id = $2, input = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(step_id)
        .bind(worker_id)
        .bind(&input_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::StepNotFound(step_id))?;
        row_to_step(&row)
    }

    #[instrument(skip(self, output, advance))]
    async fn complete_step_and_advance(
        &self,
        step_id: Uuid,
        output: Envelope,
        advance: Advance,
    ) -> Result<WorkflowStep, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let output_json = to_json(&output)?;
        let row = sqlx::query(
            r#"
            UPDATE workflow_steps SET status = 'completed', output = $2 WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(step_id)
        .bind(&output_json)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::StepNotFound(step_id))?;
        let step = row_to_step(&row)?;

        // Get-or-create each successor's step row, then decide readiness
        // from step statuses read inside this same transaction. Postgres's
        // default read-committed isolation lets two sibling completions'
        // transactions interleave, so the target row is locked with
        // `FOR UPDATE` before its dependencies are checked — a concurrent
        // completion reaching the same target blocks on that lock instead
        // of racing the readiness decision (mirrors the in-memory store's
        // single mutex covering the identical critical section).
        let step_count_row: (i64,) = sqlx::query_as("SELECT count(*) FROM workflow_steps WHERE run_id = $1")
            .bind(step.run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut next_step_number = step_count_row.0 as u32 + 1;

        for successor in &advance.successors {
            let existing = sqlx::query(
                "SELECT id FROM workflow_steps WHERE run_id = $1 AND node_id = $2 FOR UPDATE",
            )
            .bind(step.run_id)
            .bind(&successor.target_node_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            let target_id = if let Some(row) = existing {
                row.get::<Uuid, _>("id")
            } else {
                // If this successor depends on the completing node and that
                // node was itself a fan-out child, "the predecessor" means
                // every sibling sharing its group_id, not just the one row
                // that happens to be completing right now.
                let mut depends_on = Vec::with_capacity(successor.target_depends_on_node_ids.len());
                for node_id in &successor.target_depends_on_node_ids {
                    if node_id == &step.node_id {
                        if let Some(gid) = successor.source_group_id {
                            let rows = sqlx::query(
                                "SELECT id FROM workflow_steps WHERE run_id = $1 AND node_id = $2 AND group_id = $3 FOR UPDATE",
                            )
                            .bind(step.run_id)
                            .bind(node_id)
                            .bind(gid)
                            .fetch_all(&mut *tx)
                            .await
                            .map_err(|e| StoreError::Database(e.to_string()))?;
                            depends_on.extend(rows.iter().map(|r| r.get::<Uuid, _>("id")));
                            continue;
                        }
                    }
                    if let Some(row) = sqlx::query("SELECT id FROM workflow_steps WHERE run_id = $1 AND node_id = $2")
                        .bind(step.run_id)
                        .bind(node_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| StoreError::Database(e.to_string()))?
                    {
                        depends_on.push(row.get::<Uuid, _>("id"));
                    }
                }

                let new_id = Uuid::now_v7();
                sqlx::query(
                    r#"
                    INSERT INTO workflow_steps
                        (id, run_id, node_id, node_type, step_number, status, attempt, max_attempts,
                         node_config, depends_on, group_id)
                    VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, NULL)
                    "#,
                )
                .bind(new_id)
                .bind(step.run_id)
                .bind(&successor.target_node_id)
                .bind(&successor.target_node_type)
                .bind(next_step_number as i32)
                .bind(successor.target_max_attempts as i32)
                .bind(&successor.target_config)
                .bind(&depends_on)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
                next_step_number += 1;

                sqlx::query("UPDATE workflow_runs SET total_steps = total_steps + 1 WHERE id = $1")
                    .bind(step.run_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))?;

                new_id
            };

            let target_row = sqlx::query("SELECT status, depends_on FROM workflow_steps WHERE id = $1 FOR UPDATE")
                .bind(target_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let target_status: String = target_row.get("status");
            let target_depends_on: Vec<Uuid> = target_row.get("depends_on");

            let mut ready = target_status == "pending";
            if ready && !target_depends_on.is_empty() {
                let satisfied_row: (i64,) = sqlx::query_as(
                    "SELECT count(*) FROM workflow_steps WHERE id = ANY($1) AND status IN ('completed', 'skipped')",
                )
                .bind(&target_depends_on)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
                ready = satisfied_row.0 as usize == target_depends_on.len();
            }

            if ready {
                let already_queued: (i64,) = sqlx::query_as(
                    "SELECT count(*) FROM workflow_queue WHERE queue_type = 'execute_step' AND (payload->>'step_id')::uuid = $1",
                )
                .bind(target_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

                if already_queued.0 == 0 {
                    let payload = to_json(&crate::model::QueuePayload { run_id: step.run_id, step_id: Some(target_id) })?;
                    sqlx::query(
                        r#"
                        INSERT INTO workflow_queue
                            (id, run_id, queue_type, priority, available_at, attempt, max_attempts, payload)
                        VALUES ($1, $2, 'execute_step', $3, NOW(), 0, $4, $5)
                        "#,
                    )
                    .bind(Uuid::now_v7())
                    .bind(step.run_id)
                    .bind(successor.priority)
                    .bind(successor.queue_max_attempts as i32)
                    .bind(&payload)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))?;
                }
            }
        }

        if !advance.fan_out.is_empty() {
            let agent_id_row: (Uuid,) = sqlx::query_as("SELECT workflow_id FROM workflow_runs WHERE id = $1")
                .bind(step.run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let agent_id = agent_id_row.0;
            let group_id = step_id;

            for child in &advance.fan_out {
                let child_id = Uuid::now_v7();
                let trace = Trace::new(agent_id, step.run_id, child.node_id.clone(), next_step_number);
                let envelope = Envelope::new(child.input.clone(), trace);
                let input_json = to_json(&envelope)?;

                sqlx::query(
                    r#"
                    INSERT INTO workflow_steps
                        (id, run_id, node_id, node_type, step_number, status, attempt, max_attempts,
                         node_config, depends_on, group_id, input)
                    VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(child_id)
                .bind(step.run_id)
                .bind(&child.node_id)
                .bind(&child.node_type)
                .bind(next_step_number as i32)
                .bind(child.max_attempts as i32)
                .bind(&child.config)
                .bind(vec![step_id])
                .bind(group_id)
                .bind(&input_json)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
                next_step_number += 1;

                sqlx::query("UPDATE workflow_runs SET total_steps = total_steps + 1 WHERE id = $1")
                    .bind(step.run_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))?;

                let payload = to_json(&crate::model::QueuePayload { run_id: step.run_id, step_id: Some(child_id) })?;
                sqlx::query(
                    r#"
                    INSERT INTO workflow_queue
                        (id, run_id, queue_type, priority, available_at, attempt, max_attempts, payload)
                    VALUES ($1, $2, 'execute_step', $3, NOW(), 0, $4, $5)
                    "#,
                )
                .bind(Uuid::now_v7())
                .bind(step.run_id)
                .bind(child.priority)
                .bind(child.queue_max_attempts as i32)
                .bind(&payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            }
        }

        if !advance.variables_patch.is_empty() {
            let patch_json = serde_json::Value::Object(advance.variables_patch.clone());
            sqlx::query("UPDATE workflow_runs SET variables = variables || $1::jsonb WHERE id = $2")
                .bind(&patch_json)
                .bind(step.run_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        sqlx::query("UPDATE workflow_runs SET completed_steps = completed_steps + 1 WHERE id = $1")
            .bind(step.run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some((status, run_output, run_error)) = advance.run_terminal {
            let output_json = run_output.map(|o| to_json(&o)).transpose()?;
            let error_json = run_error.map(|e| to_json(&e)).transpose()?;
            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = $2, completed_at = NOW(), output = COALESCE($3, output), error = COALESCE($4, error)
                WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(step.run_id)
            .bind(run_status_str(status))
            .bind(&output_json)
            .bind(&error_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(step)
    }

    async fn fail_step(&self, step_id: Uuid, error: ErrorDetails) -> Result<WorkflowStep, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;
        let error_json = to_json(&error)?;
        let row = sqlx::query("UPDATE workflow_steps SET status = 'failed', error = $2 WHERE id = $1 RETURNING *")
            .bind(step_id)
            .bind(&error_json)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::StepNotFound(step_id))?;
        let step = row_to_step(&row)?;
        sqlx::query("UPDATE workflow_runs SET failed_steps = failed_steps + 1 WHERE id = $1")
            .bind(step.run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(step)
    }

    async fn skip_step(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let row = sqlx::query("UPDATE workflow_steps SET status = 'skipped' WHERE id = $1 RETURNING *")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::StepNotFound(step_id))?;
        row_to_step(&row)
    }

    async fn mark_step_pending_for_retry(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let row = sqlx::query(
            "UPDATE workflow_steps SET status = 'pending', assigned_worker_id = NULL WHERE id = $1 RETURNING *",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::StepNotFound(step_id))?;
        row_to_step(&row)
    }

    async fn suspend_step(&self, step_id: Uuid, error: ErrorDetails) -> Result<WorkflowStep, StoreError> {
        let error_json = to_json(&error)?;
        let row = sqlx::query("UPDATE workflow_steps SET status = 'suspended', error = $2 WHERE id = $1 RETURNING *")
            .bind(step_id)
            .bind(&error_json)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::StepNotFound(step_id))?;
        row_to_step(&row)
    }

    async fn reset_step_for_retry(&self, step_id: Uuid) -> Result<WorkflowStep, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'pending', attempt = 0, error = NULL, next_retry_at = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::Database(format!("step {step_id} is not in a failed state")))?;
        row_to_step(&row)
    }

    async fn enqueue(&self, new_item: NewQueueItem) -> Result<QueueItem, StoreError> {
        let payload = to_json(&new_item.payload)?;
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_queue (id, run_id, queue_type, priority, available_at, attempt, max_attempts, payload)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(new_item.run_id)
        .bind(queue_type_str(new_item.queue_type))
        .bind(new_item.priority)
        .bind(new_item.available_at)
        .bind(new_item.max_attempts as i32)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_queue_item(&row)
    }

    #[instrument(skip(self, capabilities))]
    async fn claim(
        &self,
        worker_id: &str,
        capabilities: &[QueueType],
        limit: u32,
    ) -> Result<Vec<ClaimedQueueItem>, StoreError> {
        if capabilities.is_empty() {
            return Ok(vec![]);
        }
        let types: Vec<&'static str> = capabilities.iter().map(|c| queue_type_str(*c)).collect();

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM workflow_queue
                WHERE claimed_by IS NULL
                  AND available_at <= NOW()
                  AND queue_type = ANY($1)
                ORDER BY priority DESC, available_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_queue q
            SET claimed_by = $3, claim_expires_at = NOW() + INTERVAL '120 seconds'
            FROM claimable c
            WHERE q.id = c.id
            RETURNING q.*
            "#,
        )
        .bind(&types)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim queue items: {e}");
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(|r| row_to_queue_item(r).map(|item| ClaimedQueueItem { item })).collect()
    }

    async fn extend_lease(&self, item_id: Uuid, worker_id: &str, extra_lease: Duration) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_queue
            SET claim_expires_at = claim_expires_at + ($3 || ' milliseconds')::interval
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .bind(extra_lease.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotHeld { item_id });
        }
        Ok(())
    }

    async fn complete_queue_item(&self, item_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM workflow_queue WHERE id = $1 AND claimed_by = $2")
            .bind(item_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotHeld { item_id });
        }
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<QueueFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM workflow_queue WHERE id = $1 AND claimed_by = $2 FOR UPDATE")
            .bind(item_id)
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ClaimNotHeld { item_id })?;
        let item = row_to_queue_item(&row)?;

        if item.attempt + 1 < item.max_attempts {
            let available_at = next_available_at.unwrap_or_else(Utc::now);
            sqlx::query(
                r#"
                UPDATE workflow_queue
                SET attempt = attempt + 1, claimed_by = NULL, claim_expires_at = NULL, available_at = $2
                WHERE id = $1
                "#,
            )
            .bind(item_id)
            .bind(available_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(QueueFailureOutcome::Requeued { next_attempt: item.attempt + 1, available_at })
        } else {
            let payload = to_json(&item.payload)?;
            sqlx::query(
                r#"
                INSERT INTO workflow_dead_letter (id, queue_item_id, run_id, queue_type, payload, error, attempts, moved_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(item_id)
            .bind(item.run_id)
            .bind(queue_type_str(item.queue_type))
            .bind(&payload)
            .bind(error)
            .bind((item.attempt + 1) as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            sqlx::query("DELETE FROM workflow_queue WHERE id = $1")
                .bind(item_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(QueueFailureOutcome::DeadLettered)
        }
    }

    async fn recover_orphaned(&self) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE workflow_queue
            SET claimed_by = NULL, claim_expires_at = NULL, attempt = attempt + 1
            WHERE claimed_by IS NOT NULL AND claim_expires_at < NOW()
            RETURNING *
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to recover orphaned queue items: {e}");
            StoreError::Database(e.to_string())
        })?;
        rows.iter().map(row_to_queue_item).collect()
    }

    async fn cancel_run_queue_items(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_queue WHERE run_id = $1 AND claimed_by IS NULL")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to cancel queue items for run {run_id}: {e}");
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_dead_letter
            WHERE ($1::uuid IS NULL OR run_id = $1)
            ORDER BY moved_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(filter.run_id)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let queue_type: String = row.get("queue_type");
                let payload: serde_json::Value = row.get("payload");
                Ok(DeadLetterEntry {
                    id: row.get("id"),
                    queue_item_id: row.get("queue_item_id"),
                    run_id: row.get("run_id"),
                    queue_type: parse_queue_type(&queue_type)?,
                    payload: from_json(payload)?,
                    error: row.get("error"),
                    attempts: row.get::<i32, _>("attempts") as u32,
                    moved_at: row.get("moved_at"),
                })
            })
            .collect()
    }

    async fn register_worker(&self, worker: WorkerRecord) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_workers
                (id, hostname, version, capabilities, status, last_heartbeat_at, started_at,
                 max_concurrent_steps, current_step_count, lifetime_completed, lifetime_failed)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW(), $6, 0, 0, 0)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                version = EXCLUDED.version,
                capabilities = EXCLUDED.capabilities,
                status = EXCLUDED.status,
                last_heartbeat_at = NOW(),
                max_concurrent_steps = EXCLUDED.max_concurrent_steps
            RETURNING *
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(&worker.version)
        .bind(&worker.capabilities)
        .bind(worker_status_str(worker.status))
        .bind(worker.max_concurrent_steps as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row_to_worker(&row)
    }

    async fn heartbeat_worker(&self, worker_id: &str, current_step_count: u32) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_workers
            SET last_heartbeat_at = NOW(), current_step_count = $2,
                status = CASE WHEN $2 > 0 THEN 'busy' ELSE 'idle' END
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(current_step_count as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_workers WHERE ($1::text IS NULL OR status = $1)
            "#,
        )
        .bind(filter.status.map(worker_status_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_worker).collect()
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn reap_stale_workers(&self, timeout: Duration) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE workflow_workers
            SET status = 'dead'
            WHERE status != 'dead' AND last_heartbeat_at < NOW() - ($1 || ' milliseconds')::interval
            RETURNING id
            "#,
        )
        .bind(timeout.as_millis() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn write_checkpoint(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        let variables = to_json(&checkpoint.variables)?;
        let envelope = checkpoint.envelope.map(|e| to_json(&e)).transpose()?;
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (id, step_id, checkpoint_type, created_at, variables, envelope)
            VALUES ($1, $2, $3, NOW(), $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(checkpoint.step_id)
        .bind(checkpoint_type_str(checkpoint.checkpoint_type))
        .bind(&variables)
        .bind(&envelope)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let checkpoint_type: String = row.get("checkpoint_type");
        let variables: serde_json::Value = row.get("variables");
        let envelope: Option<serde_json::Value> = row.get("envelope");
        Ok(Checkpoint {
            id: row.get("id"),
            step_id: row.get("step_id"),
            checkpoint_type: parse_checkpoint_type(&checkpoint_type)?,
            created_at: row.get("created_at"),
            variables: from_json(variables)?,
            envelope: envelope.map(from_json).transpose()?,
        })
    }

    async fn list_checkpoints_for_step(&self, step_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_checkpoints WHERE step_id = $1 ORDER BY created_at")
            .bind(step_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let checkpoint_type: String = row.get("checkpoint_type");
                let variables: serde_json::Value = row.get("variables");
                let envelope: Option<serde_json::Value> = row.get("envelope");
                Ok(Checkpoint {
                    id: row.get("id"),
                    step_id: row.get("step_id"),
                    checkpoint_type: parse_checkpoint_type(&checkpoint_type)?,
                    created_at: row.get("created_at"),
                    variables: from_json(variables)?,
                    envelope: envelope.map(from_json).transpose()?,
                })
            })
            .collect()
    }

    async fn append_event(&self, run_id: Uuid, event_type: &str, payload: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events (id, run_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(run_id)
        .bind(event_type)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}
