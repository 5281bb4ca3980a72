//! Workflow graph model.
//!
//! `WorkflowGraph` wraps a validated definition with the indexes the
//! executor needs: outgoing edges per node in declaration order and the
//! size of the reachable subgraph below every node.

mod validate;

pub use validate::validate;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use flowline_core::error::{FlowError, Result};
use flowline_core::workflow::{Edge, Node, WorkflowDefinition};

pub struct WorkflowGraph {
    def: Arc<WorkflowDefinition>,
    nodes: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    remaining: HashMap<String, usize>,
    trigger: usize,
}

impl WorkflowGraph {
    /// Validate `def` and index it.
    pub fn build(def: Arc<WorkflowDefinition>) -> Result<Self> {
        validate(&def)?;

        let nodes: HashMap<String, usize> = def
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in def.edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(i);
        }

        let trigger = def
            .nodes
            .iter()
            .position(|n| n.kind() == flowline_core::workflow::NodeKind::Trigger)
            .ok_or_else(|| FlowError::Structure("workflow has no trigger node".into()))?;

        let mut graph = Self {
            def,
            nodes,
            outgoing,
            remaining: HashMap::new(),
            trigger,
        };
        graph.remaining = graph
            .def
            .nodes
            .iter()
            .map(|n| (n.id.clone(), graph.count_reachable(&n.id)))
            .collect();
        Ok(graph)
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.def
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).map(|&i| &self.def.nodes[i])
    }

    pub fn trigger(&self) -> &Node {
        &self.def.nodes[self.trigger]
    }

    /// Edges leaving `node_id`, in declaration order.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(node_id)
            .map(|idxs| idxs.iter().map(|&i| &self.def.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Number of nodes reachable from `node_id`, counting the node itself.
    pub fn remaining_from(&self, node_id: &str) -> usize {
        self.remaining.get(node_id).copied().unwrap_or(1)
    }

    fn count_reachable(&self, start: &str) -> usize {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in self.outgoing_edges(id) {
                if seen.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
        seen.len()
    }
}
