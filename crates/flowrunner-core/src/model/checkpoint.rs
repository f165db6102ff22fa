//! `Checkpoint` — persisted execution context enabling resume after
//! pause or crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::envelope::Envelope;

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    PreExecute,
    PostExecute,
    UserSuspend,
}

/// Execution context snapshot (variables + the relevant envelope) at a
/// point in a step (§3).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub step_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub created_at: DateTime<Utc>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub step_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub variables: serde_json::Map<String, Value>,
    pub envelope: Option<Envelope>,
}
