//! The envelope data contract passed between nodes
//!
//! An envelope is the only value that ever crosses a node boundary. It
//! carries the payload plus enough lineage (a `Trace`) to explain, after
//! the fact, which run/step/attempt produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lineage attached to every envelope.
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trace {
    pub agent_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub step: u32,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<Uuid>,
}

impl Trace {
    pub fn new(agent_id: Uuid, run_id: Uuid, node_id: impl Into<String>, step: u32) -> Self {
        Self {
            agent_id,
            run_id,
            node_id: node_id.into(),
            step,
            attempt: 1,
            parent_trace_id: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_parent(mut self, parent_trace_id: Uuid) -> Self {
        self.parent_trace_id = Some(parent_trace_id);
        self
    }
}

/// An error surfaced inline in an envelope (distinct from a step's
/// terminal `ErrorDetails` — this is for nodes that want to report a
/// partial/soft error alongside otherwise-usable data).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// The data contract passed between nodes.
///
/// `data` is untyped JSON by design (§9 "Dynamic JSON in envelopes"):
/// node authors declare expected shapes in their `Meta` parameters for
/// UI-level validation, but the runtime itself enforces only
/// presence, not deep types.
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub data: Value,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub variables: serde_json::Map<String, Value>,
    pub trace: Trace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<EnvelopeError>>,
}

impl Envelope {
    pub fn new(data: Value, trace: Trace) -> Self {
        Self {
            id: Uuid::now_v7(),
            issued_at: Utc::now(),
            version: 1,
            data_type: None,
            data,
            variables: serde_json::Map::new(),
            trace,
            binary: None,
            errors: None,
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn with_variables(mut self, variables: serde_json::Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Merge `data` from several upstream envelopes (fan-in) using
    /// last-writer-wins over the JSON object keys, in edge definition
    /// order (§4.D "merge order = edge definition order").
    pub fn merge(envelopes: &[Envelope], trace: Trace) -> Self {
        let mut merged = serde_json::Map::new();
        let mut variables = serde_json::Map::new();
        for env in envelopes {
            if let Value::Object(map) = &env.data {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            } else if envelopes.len() == 1 {
                return Self::new(env.data.clone(), trace).with_variables(env.variables.clone());
            }
            for (k, v) in &env.variables {
                variables.insert(k.clone(), v.clone());
            }
        }
        Self::new(Value::Object(merged), trace).with_variables(variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> Trace {
        Trace::new(Uuid::now_v7(), Uuid::now_v7(), "node-a", 1)
    }

    #[test]
    fn merge_last_writer_wins_in_edge_order() {
        let a = Envelope::new(serde_json::json!({"x": 1, "y": 1}), trace());
        let b = Envelope::new(serde_json::json!({"y": 2}), trace());
        let merged = Envelope::merge(&[a, b], trace());
        assert_eq!(merged.data["x"], 1);
        assert_eq!(merged.data["y"], 2);
    }

    #[test]
    fn merge_single_envelope_preserves_non_object_data() {
        let a = Envelope::new(serde_json::json!([1, 2, 3]), trace());
        let merged = Envelope::merge(std::slice::from_ref(&a), trace());
        assert_eq!(merged.data, serde_json::json!([1, 2, 3]));
    }
}
