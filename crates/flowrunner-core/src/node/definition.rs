//! The Node Runtime contract (§4.C): `Meta`, `Initialize`, `ExecuteEnvelope`.

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{Envelope, ErrorDetails};

use super::context::{ExecutionContext, Platform};

/// Static description of a node type, returned by `NodeRuntime::meta`.
/// Used by the registry for validation and by API callers that list
/// available node types (§6).
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub type_id: String,
    pub display_name: String,
    pub description: String,
    /// Output handles this node type may emit on (§4.D branching).
    /// A node with a single implicit handle returns an empty list.
    pub handles: Vec<String>,
}

impl NodeMeta {
    pub fn new(type_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            display_name: display_name.into(),
            description: String::new(),
            handles: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_handles(mut self, handles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.handles = handles.into_iter().map(Into::into).collect();
        self
    }
}

/// What a node execution produced.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub envelope: Envelope,
    /// Which outgoing handle to route `envelope` through (§4.D). `None`
    /// routes through every edge with no `source_handle`.
    pub handle: Option<String>,
    /// Set by a `ForEach`-shaped node instead of routing `envelope`
    /// itself: one JSON value per element to fan out into a sibling
    /// child step per element, all sharing one `group_id` (§4.D "ForEach
    /// is implemented as the engine creating one child step per element
    /// with a shared parent group id"). `envelope` is still recorded as
    /// this step's own completed output (checkpoints, run output if this
    /// is the run's last step) but is not merged into any successor's
    /// input when `items` is set.
    pub items: Option<Vec<Value>>,
    /// Run-variable mutations this execution wants made durable (§5
    /// "mutations via `ctx.platform.set_variable(k,v)` are durable but
    /// racy — last-writer-wins with timestamp"). Applied to the run's
    /// `variables` in the same transaction as step completion.
    #[doc(hidden)]
    pub variables_patch: serde_json::Map<String, Value>,
}

impl NodeOutput {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope, handle: None, items: None, variables_patch: serde_json::Map::new() }
    }

    pub fn on_handle(envelope: Envelope, handle: impl Into<String>) -> Self {
        Self { envelope, handle: Some(handle.into()), items: None, variables_patch: serde_json::Map::new() }
    }

    /// `envelope` is kept as this step's own recorded output; `items` is
    /// what the engine fans out over.
    pub fn fan_out(envelope: Envelope, items: Vec<Value>, handle: impl Into<String>) -> Self {
        Self { envelope, handle: Some(handle.into()), items: Some(items), variables_patch: serde_json::Map::new() }
    }

    pub fn with_variables_patch(mut self, patch: serde_json::Map<String, Value>) -> Self {
        self.variables_patch = patch;
        self
    }
}

/// A node's own execution failure, distinct from `ErrorDetails` (the
/// persisted record) so node authors can construct failures without
/// reaching into the step/run schema.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{details}")]
pub struct NodeError {
    pub details: ErrorDetails,
}

impl NodeError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { details: ErrorDetails::retryable(message) }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { details: ErrorDetails::permanent(message) }
    }
}

impl From<NodeError> for ErrorDetails {
    fn from(err: NodeError) -> Self {
        err.details
    }
}

/// A node type's executable behavior (§4.C). Dynamically dispatched —
/// node config and envelope data are both `serde_json::Value`-backed,
/// so one registry entry per type id is enough; there is no need for
/// the generic-associated-type wrapper a statically-typed activity
/// registry would require.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    fn meta(&self) -> NodeMeta;

    /// Called once per process after construction, before any
    /// `execute_envelope` call. Nodes that need no setup can accept the
    /// default no-op implementation.
    async fn initialize(&self, _platform: &dyn Platform) -> Result<(), NodeError> {
        Ok(())
    }

    /// Run this node against one input envelope. `config` is the
    /// node's static, per-graph-node JSON config (§3 GraphNode); `input`
    /// is the merged envelope produced by its predecessors (§4.D).
    async fn execute_envelope(
        &self,
        ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_error_converts_to_error_details() {
        let err = NodeError::permanent("bad config");
        let details: ErrorDetails = err.into();
        assert_eq!(details.kind, crate::model::ErrorKind::Permanent);
    }
}
