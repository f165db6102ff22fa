//! `QueueItem` — a unit of durable hand-off between the engine and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    StartRun,
    ExecuteStep,
    RetryStep,
    RecoverRun,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::StartRun => "start_run",
            QueueType::ExecuteStep => "execute_step",
            QueueType::RetryStep => "retry_step",
            QueueType::RecoverRun => "recover_run",
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_run" => Ok(QueueType::StartRun),
            "execute_step" => Ok(QueueType::ExecuteStep),
            "retry_step" => Ok(QueueType::RetryStep),
            "recover_run" => Ok(QueueType::RecoverRun),
            other => Err(format!("unknown queue type: {other:?}")),
        }
    }
}

/// What a queue item refers to — a run (for `start_run`/`recover_run`)
/// or a step (for `execute_step`/`retry_step`).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueuePayload {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
}

/// A unit of work persisted for durable hand-off (§3).
///
/// Invariant: an item with `claimed_by != None && claim_expires_at > now()`
/// is hidden from claims.
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub queue_type: QueueType,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: QueuePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub run_id: Uuid,
    pub queue_type: QueueType,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub max_attempts: u32,
    pub payload: QueuePayload,
}

impl NewQueueItem {
    pub fn now(run_id: Uuid, queue_type: QueueType, priority: i32, payload: QueuePayload) -> Self {
        Self {
            run_id,
            queue_type,
            priority,
            available_at: Utc::now(),
            max_attempts: 1,
            payload,
        }
    }
}

/// Outcome of failing a claimed queue item — mirrors the Work Queue's
/// Fail contract (§4.B): requeue with backoff, or dead-letter.
#[derive(Debug, Clone)]
pub enum QueueFailureOutcome {
    Requeued { next_attempt: u32, available_at: DateTime<Utc> },
    DeadLettered,
}

/// An item that exhausted `max_attempts`, queryable for operator
/// intervention (§4.B, §6 `workflow_dead_letter`).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub queue_item_id: Uuid,
    pub run_id: Uuid,
    pub queue_type: QueueType,
    pub payload: QueuePayload,
    pub error: String,
    pub attempts: u32,
    pub moved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub run_id: Option<Uuid>,
}
