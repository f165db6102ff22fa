//! The static workflow graph (§3 Workflow) and pure graph analysis used
//! both at version-deployment time (reject cyclic graphs) and at
//! run-start time (compute entry steps and successors).

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
}

#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

/// `{nodes: [{id, type, config}], edges: [{id, source, source_handle?, target, target_handle?}]}`
/// — immutable once deployed as a version (§3).
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected involving node(s): {0:?}")]
    CycleDetected(Vec<String>),
    #[error("edge {edge_id} references unknown node {node_id}")]
    UnknownNode { edge_id: String, node_id: String },
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("graph has no entry point (every node has an incoming edge)")]
    NoEntryPoint,
}

impl WorkflowGraph {
    fn adjacency(&self) -> Result<HashMap<&str, Vec<&GraphEdge>>, GraphError> {
        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if node_ids.len() != self.nodes.len() {
            let mut seen = HashSet::new();
            for n in &self.nodes {
                if !seen.insert(n.id.as_str()) {
                    return Err(GraphError::DuplicateNode(n.id.clone()));
                }
            }
        }
        let mut adj: HashMap<&str, Vec<&GraphEdge>> = HashMap::new();
        for edge in &self.edges {
            if !node_ids.contains(edge.source.as_str()) {
                return Err(GraphError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: edge.source.clone(),
                });
            }
            if !node_ids.contains(edge.target.as_str()) {
                return Err(GraphError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: edge.target.clone(),
                });
            }
            adj.entry(edge.source.as_str()).or_default().push(edge);
        }
        Ok(adj)
    }

    /// Nodes with no incoming edges — usually the graph's trigger nodes
    /// (§4.D StartRun step 2).
    pub fn entry_points(&self) -> Vec<&str> {
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !targets.contains(id))
            .collect()
    }

    pub fn predecessors_of(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    /// Outgoing edges from `node_id` whose `source_handle` matches the
    /// handle the node emitted on (§4.D "only edges whose source_handle
    /// matches the emitted handle yield successor steps"). `handle =
    /// None` matches edges with no `source_handle` set (the common,
    /// non-branching case).
    pub fn successors_of<'a>(&'a self, node_id: &str, handle: Option<&str>) -> Vec<&'a GraphEdge> {
        self.edges
            .iter()
            .filter(|e| e.source == node_id && e.source_handle.as_deref() == handle)
            .collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Topologically analyze the graph into levels via Kahn's algorithm.
    /// Each level is a set of nodes whose predecessors are all in
    /// earlier levels; nodes within a level have no dependency on each
    /// other and may run concurrently (§4.D fan-out).
    ///
    /// Returns `GraphError::CycleDetected` if nodes remain unvisited
    /// after the queue drains — this is the DFS/Kahn check version
    /// deployment uses to reject cyclic graphs (§4.D, §8 boundary
    /// scenario 6).
    pub fn levels(&self) -> Result<Vec<Vec<&str>>, GraphError> {
        self.adjacency()?;
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &self.edges {
            *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        if queue.is_empty() && !self.nodes.is_empty() {
            return Err(GraphError::NoEntryPoint);
        }

        let mut levels = Vec::new();
        let mut visited = 0usize;
        let mut remaining = in_degree.clone();

        while !queue.is_empty() {
            let mut level: Vec<&str> = queue.drain(..).collect();
            level.sort_unstable();
            visited += level.len();

            let mut next = Vec::new();
            for node_id in &level {
                for edge in self.edges.iter().filter(|e| e.source == *node_id) {
                    let deg = remaining.get_mut(edge.target.as_str()).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(edge.target.as_str());
                    }
                }
            }
            levels.push(level);
            queue.extend(next);
        }

        if visited != self.nodes.len() {
            let cyclic: Vec<String> = remaining
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(GraphError::CycleDetected(cyclic));
        }

        Ok(levels)
    }

    pub fn has_cycle(&self) -> bool {
        matches!(self.levels(), Err(GraphError::CycleDetected(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            node_type: "noop".to_string(),
            config: Value::Null,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> GraphEdge {
        GraphEdge {
            id: id.to_string(),
            source: source.to_string(),
            source_handle: None,
            target: target.to_string(),
            target_handle: None,
        }
    }

    #[test]
    fn linear_chain_has_one_entry_and_three_levels() {
        let graph = WorkflowGraph {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![edge("e1", "a", "b"), edge("e2", "b", "c")],
        };
        assert_eq!(graph.entry_points(), vec!["a"]);
        let levels = graph.levels().unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn fan_out_fan_in_shares_a_level() {
        let graph = WorkflowGraph {
            nodes: vec![node("a"), node("b"), node("c"), node("d")],
            edges: vec![
                edge("e1", "a", "b"),
                edge("e2", "a", "c"),
                edge("e3", "b", "d"),
                edge("e4", "c", "d"),
            ],
        };
        let levels = graph.levels().unwrap();
        assert_eq!(levels[0], vec!["a"]);
        assert_eq!(levels[1], vec!["b", "c"]);
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn cycle_is_detected() {
        let graph = WorkflowGraph {
            nodes: vec![node("a"), node("b")],
            edges: vec![edge("e1", "a", "b"), edge("e2", "b", "a")],
        };
        assert!(graph.has_cycle());
        match graph.levels() {
            Err(GraphError::CycleDetected(mut nodes)) => {
                nodes.sort();
                assert_eq!(nodes, vec!["a", "b"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let graph = WorkflowGraph {
            nodes: vec![node("a")],
            edges: vec![edge("e1", "a", "ghost")],
        };
        assert_eq!(
            graph.levels(),
            Err(GraphError::UnknownNode {
                edge_id: "e1".to_string(),
                node_id: "ghost".to_string()
            })
        );
    }

    #[test]
    fn branching_only_matches_its_source_handle() {
        let graph = WorkflowGraph {
            nodes: vec![node("if"), node("yes"), node("no")],
            edges: vec![
                GraphEdge {
                    id: "e1".into(),
                    source: "if".into(),
                    source_handle: Some("true".into()),
                    target: "yes".into(),
                    target_handle: None,
                },
                GraphEdge {
                    id: "e2".into(),
                    source: "if".into(),
                    source_handle: Some("false".into()),
                    target: "no".into(),
                    target_handle: None,
                },
            ],
        };
        let matched = graph.successors_of("if", Some("true"));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].target, "yes");
    }
}
