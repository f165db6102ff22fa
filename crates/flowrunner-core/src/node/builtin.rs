//! A small set of built-in node types so the engine is runnable and
//! testable end to end without depending on an external node library
//! (§1 "A small set of built-in node types... ships to make the engine
//! runnable and testable end to end").

use async_trait::async_trait;
use serde_json::Value;

use crate::model::Envelope;

use super::context::ExecutionContext;
use super::definition::{NodeError, NodeMeta, NodeOutput, NodeRuntime};

/// Emits its input unchanged. Useful as a graph entry point or a no-op
/// placeholder while a workflow is under construction.
pub struct PassthroughNode;

#[async_trait]
impl NodeRuntime for PassthroughNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("noop", "Passthrough").with_description("Emits its input unchanged.")
    }

    async fn execute_envelope(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new(input))
    }
}

/// The implicit entry node every graph is given if its deployed version
/// has no explicit trigger node. Carries the run's initial input through
/// unchanged; exists mainly so entry points always have a concrete
/// `node_type` to dispatch on.
pub struct StartNode;

#[async_trait]
impl NodeRuntime for StartNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("start", "Start").with_description("Run entry point; emits the run's input.")
    }

    async fn execute_envelope(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new(input))
    }
}

/// Evaluates `config.field` (a dotted path into `input.data`) for
/// truthiness and emits on the `"true"` or `"false"` handle (§4.D
/// branching: "only edges whose `source_handle` matches the emitted
/// handle yield successor steps").
pub struct IfNode;

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |acc, part| acc.get(part))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

#[async_trait]
impl NodeRuntime for IfNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("if", "If")
            .with_description("Branches on the truthiness of `config.field`.")
            .with_handles(["true", "false"])
    }

    async fn execute_envelope(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::permanent("if node requires a string `field` in config"))?;
        let handle = if is_truthy(lookup(&input.data, field)) { "true" } else { "false" };
        Ok(NodeOutput::on_handle(input, handle))
    }
}

/// Matches `config.field` against `config.cases` (a JSON object of
/// `{value: handle}`) and emits on the matched handle, falling back to
/// `config.default` when present, or `NodeError::permanent` otherwise.
pub struct SwitchNode;

#[async_trait]
impl NodeRuntime for SwitchNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("switch", "Switch")
            .with_description("Routes to the handle matching `config.field`'s value in `config.cases`.")
    }

    async fn execute_envelope(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let field = config
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::permanent("switch node requires a string `field` in config"))?;
        let value = lookup(&input.data, field);
        let key = match value {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        let cases = config.get("cases").and_then(Value::as_object);
        let handle = cases
            .and_then(|c| c.get(&key))
            .and_then(Value::as_str)
            .or_else(|| config.get("default").and_then(Value::as_str));
        match handle {
            Some(h) => Ok(NodeOutput::on_handle(input, h.to_string())),
            None => Err(NodeError::permanent(format!(
                "switch node has no case or default for value {key:?}"
            ))),
        }
    }
}

/// Reads the array found at `config.items_field` in `input.data` and
/// hands every element to `NodeOutput::fan_out` so the engine can create
/// one child step per element sharing a `group_id` (§4.D "ForEach is
/// implemented as the engine creating one child step per element with a
/// shared parent group id"). The node itself does no step creation —
/// that is the engine's job, since only the engine can talk to the
/// store — it only validates the field and splits the array.
pub struct ForEachNode;

#[async_trait]
impl NodeRuntime for ForEachNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("for_each", "For Each")
            .with_description("Fans out over `config.items_field`, one child step per element.")
            .with_handles(["each"])
    }

    async fn execute_envelope(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        let field = config
            .get("items_field")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::permanent("for_each node requires a string `items_field` in config"))?;
        match lookup(&input.data, field) {
            Some(Value::Array(items)) => {
                let items = items.clone();
                Ok(NodeOutput::fan_out(input, items, "each"))
            }
            Some(_) => Err(NodeError::permanent(format!("`{field}` is not an array"))),
            None => Err(NodeError::permanent(format!("`{field}` not found in input data"))),
        }
    }
}

/// Fan-in node: by the time the engine invokes it, `input` already holds
/// the merged envelope produced by `Envelope::merge` over every
/// predecessor (§4.D). Passes it through unchanged; exists to give the
/// merge point a visible, addressable node in the graph.
pub struct MergeNode;

#[async_trait]
impl NodeRuntime for MergeNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("merge", "Merge").with_description("Fan-in point; emits the already-merged input.")
    }

    async fn execute_envelope(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        input: Envelope,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Trace;
    use std::sync::Arc;
    use uuid::Uuid;

    struct NoopPlatform;

    #[async_trait]
    impl super::super::context::Platform for NoopPlatform {
        async fn http(
            &self,
            _request: super::super::context::HttpRequest,
        ) -> Result<super::super::context::HttpResponse, super::super::context::PlatformError> {
            unimplemented!()
        }
        async fn storage_get(&self, _key: &str) -> Result<Option<Vec<u8>>, super::super::context::PlatformError> {
            Ok(None)
        }
        async fn storage_put(&self, _key: &str, _value: Vec<u8>) -> Result<(), super::super::context::PlatformError> {
            Ok(())
        }
        async fn resolve_secret(&self, name: &str) -> Result<String, super::super::context::PlatformError> {
            Err(super::super::context::PlatformError::SecretNotFound(name.to_string()))
        }
        async fn resolve_credential(&self, name: &str) -> Result<String, super::super::context::PlatformError> {
            Err(super::super::context::PlatformError::SecretNotFound(name.to_string()))
        }
        fn log(&self, _level: tracing::Level, _message: &str, _fields: Value) {}
        fn emit(&self, _event: &str, _payload: Value) {}
        async fn sleep(&self, _duration: std::time::Duration) {}
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "n1",
            1,
            3,
            serde_json::Map::new(),
            Arc::new(NoopPlatform),
        )
    }

    fn envelope(data: Value) -> Envelope {
        Envelope::new(data, Trace::new(Uuid::now_v7(), Uuid::now_v7(), "n1", 1))
    }

    #[tokio::test]
    async fn if_node_routes_on_truthiness() {
        let node = IfNode;
        let config = serde_json::json!({"field": "ok"});
        let out = node
            .execute_envelope(&ctx(), &config, envelope(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(out.handle.as_deref(), Some("true"));

        let out = node
            .execute_envelope(&ctx(), &config, envelope(serde_json::json!({"ok": false})))
            .await
            .unwrap();
        assert_eq!(out.handle.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn switch_node_falls_back_to_default() {
        let node = SwitchNode;
        let config = serde_json::json!({"field": "kind", "cases": {"a": "handle_a"}, "default": "handle_default"});
        let out = node
            .execute_envelope(&ctx(), &config, envelope(serde_json::json!({"kind": "z"})))
            .await
            .unwrap();
        assert_eq!(out.handle.as_deref(), Some("handle_default"));
    }

    #[tokio::test]
    async fn switch_node_without_default_errors_on_miss() {
        let node = SwitchNode;
        let config = serde_json::json!({"field": "kind", "cases": {"a": "handle_a"}});
        let result = node
            .execute_envelope(&ctx(), &config, envelope(serde_json::json!({"kind": "z"})))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn for_each_node_fans_out_one_item_per_element() {
        let node = ForEachNode;
        let config = serde_json::json!({"items_field": "items"});
        let out = node
            .execute_envelope(&ctx(), &config, envelope(serde_json::json!({"items": [1, 2, 3]})))
            .await
            .unwrap();
        assert_eq!(out.handle.as_deref(), Some("each"));
        assert_eq!(out.items, Some(vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]));

        let err = node
            .execute_envelope(&ctx(), &config, envelope(serde_json::json!({"items": "not an array"})))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn passthrough_and_merge_emit_input_unchanged() {
        let input = envelope(serde_json::json!({"x": 1}));
        let out = PassthroughNode
            .execute_envelope(&ctx(), &Value::Null, input.clone())
            .await
            .unwrap();
        assert_eq!(out.envelope.data, input.data);

        let out = MergeNode.execute_envelope(&ctx(), &Value::Null, input.clone()).await.unwrap();
        assert_eq!(out.envelope.data, input.data);
    }
}
