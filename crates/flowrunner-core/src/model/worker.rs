//! `Worker` — registration and liveness record for a worker process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Dead,
}

/// A long-lived process that executes steps by claiming queue items
/// (§3). Identity is stable across restarts via an explicit id (the
/// worker pool defaults this to `hostname-pid` when unset).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub max_concurrent_steps: u32,
    pub current_step_count: u32,
    pub lifetime_completed: u64,
    pub lifetime_failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
}
