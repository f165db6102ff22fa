//! Process-wide node type registry (§4.C, §9 Open Question resolved):
//! a read-only map populated once at startup, looked up by type id at
//! step-dispatch time. No runtime reflection or dynamic loading.

use std::collections::HashMap;
use std::sync::Arc;

use super::definition::{NodeMeta, NodeRuntime};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown node type: {0:?}")]
    UnknownType(String),
    #[error("node type {0:?} registered more than once")]
    DuplicateType(String),
}

/// Built via [`NodeRegistryBuilder`] at startup and shared read-only
/// (an `Arc<NodeRegistry>`) across the engine and every worker.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn NodeRuntime>>,
}

impl NodeRegistry {
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::default()
    }

    pub fn get(&self, type_id: &str) -> Result<Arc<dyn NodeRuntime>, RegistryError> {
        self.nodes
            .get(type_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType(type_id.to_string()))
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.nodes.contains_key(type_id)
    }

    pub fn list_meta(&self) -> Vec<NodeMeta> {
        let mut metas: Vec<_> = self.nodes.values().map(|n| n.meta()).collect();
        metas.sort_by(|a, b| a.type_id.cmp(&b.type_id));
        metas
    }
}

#[derive(Default)]
pub struct NodeRegistryBuilder {
    nodes: HashMap<String, Arc<dyn NodeRuntime>>,
}

impl NodeRegistryBuilder {
    pub fn register(mut self, node: impl NodeRuntime + 'static) -> Result<Self, RegistryError> {
        let type_id = node.meta().type_id;
        if self.nodes.contains_key(&type_id) {
            return Err(RegistryError::DuplicateType(type_id));
        }
        self.nodes.insert(type_id, Arc::new(node));
        Ok(self)
    }

    pub fn build(self) -> NodeRegistry {
        NodeRegistry { nodes: self.nodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::builtin::PassthroughNode;

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = NodeRegistry::builder()
            .register(PassthroughNode)
            .unwrap()
            .register(PassthroughNode);
        assert!(matches!(result, Err(RegistryError::DuplicateType(_))));
    }

    #[test]
    fn unknown_type_lookup_fails() {
        let registry = NodeRegistry::builder().build();
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownType(_))
        ));
    }
}
