//! `WorkflowStep` — execution of a single graph node within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::envelope::Envelope;
use super::error::ErrorDetails;

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Awaiting human action (§7 `UserInput`); resumes back to `pending`
    /// only via an explicit out-of-band API call, never automatically.
    Suspended,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Suspended => "suspended",
        };
        write!(f, "{s}")
    }
}

/// Execution of a single node within a run; may be retried (§3).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub step_number: u32,
    pub status: StepStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Envelope>,
    pub node_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub depends_on: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Shared identifier for sibling steps spawned by one `ForEach` node
    /// (§4.D "implemented as the engine creating one child step per
    /// element with a shared parent group id").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub step_number: u32,
    pub node_config: Value,
    pub depends_on: Vec<Uuid>,
    pub max_attempts: u32,
    pub group_id: Option<Uuid>,
}
