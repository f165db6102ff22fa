//! `WorkflowRun` — the persistent record of a single execution instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::envelope::Envelope;
use super::error::ErrorDetails;
use super::graph::WorkflowGraph;
use super::retry::RetryPolicy;

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are absorbing (§3 WorkflowRun invariants).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The persistent record of a single execution instance of a workflow
/// version (§3).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<Uuid>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Envelope>,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub variables: serde_json::Map<String, Value>,
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    /// Snapshot of the graph this run executes, taken at `StartRun`
    /// time (§6 `graph` JSON column). Runs are immune to later
    /// redeployments of the same version.
    pub graph: WorkflowGraph,
}

/// Fields needed to insert a new run; the store assigns `created_at`.
///
/// `id` is caller-assigned rather than store-assigned, unlike every other
/// `New*` type in this module: the run's own id has to be known before its
/// `input` envelope's `Trace::run_id` can be set, and that envelope is
/// built before the row exists.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub trigger_id: Option<Uuid>,
    pub input: Envelope,
    pub variables: serde_json::Map<String, Value>,
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicy,
    /// Scheduling priority inherited by the run's queue items.
    pub priority: i32,
    pub graph: WorkflowGraph,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<RunStatus>,
}
