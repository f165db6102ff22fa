//! A minimal graph resolver standing in for the "thin HTTP handlers over
//! the state store" that own workflow/version/draft CRUD (spec §1 Out of
//! scope). `StartRun` needs a graph snapshot before it can create a run;
//! this crate doesn't implement workflow versioning, so callers either
//! register a graph ahead of time under its `(workflow_id, version_id)`
//! or pass one inline on the request (useful for manual/ad-hoc runs and
//! for the end-to-end test in spec §8).

use dashmap::DashMap;
use uuid::Uuid;

use flowrunner_core::WorkflowGraph;

#[derive(Debug, thiserror::Error)]
#[error("no graph registered for workflow {workflow_id} version {version_id}")]
pub struct GraphNotFound {
    pub workflow_id: Uuid,
    pub version_id: Uuid,
}

/// Process-wide map of deployed graph snapshots, keyed by
/// `(workflow_id, version_id)`. Stands in for the versions/drafts tables
/// §1 puts out of scope; production deployments would resolve this from
/// the CRUD layer's own store instead.
#[derive(Default)]
pub struct GraphResolver {
    graphs: DashMap<(Uuid, Uuid), WorkflowGraph>,
}

impl GraphResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workflow_id: Uuid, version_id: Uuid, graph: WorkflowGraph) {
        self.graphs.insert((workflow_id, version_id), graph);
    }

    pub fn resolve(&self, workflow_id: Uuid, version_id: Uuid) -> Result<WorkflowGraph, GraphNotFound> {
        self.graphs
            .get(&(workflow_id, version_id))
            .map(|g| g.clone())
            .ok_or(GraphNotFound { workflow_id, version_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrunner_core::{GraphNode, WorkflowGraph};

    #[test]
    fn resolve_missing_graph_errors() {
        let resolver = GraphResolver::new();
        let err = resolver.resolve(Uuid::now_v7(), Uuid::now_v7());
        assert!(err.is_err());
    }

    #[test]
    fn register_then_resolve_round_trips() {
        let resolver = GraphResolver::new();
        let workflow_id = Uuid::now_v7();
        let version_id = Uuid::now_v7();
        let graph = WorkflowGraph {
            nodes: vec![GraphNode { id: "start".into(), node_type: "start".into(), config: serde_json::Value::Null }],
            edges: vec![],
        };
        resolver.register(workflow_id, version_id, graph);
        assert!(resolver.resolve(workflow_id, version_id).is_ok());
    }
}
