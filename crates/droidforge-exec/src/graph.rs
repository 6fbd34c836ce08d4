use droidforge_core::{ExecutionPlan, NodeId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{Direction, algo};
use std::collections::HashMap;

/// Immutable node dependency graph built from a plan's edges
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph. Edges naming unknown nodes are ignored; `ExecutionPlan::validate` rejects them first.
    pub fn from_plan(plan: &ExecutionPlan) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(plan.nodes.len());

        for node in &plan.nodes {
            let idx = graph.add_node(node.node_id.clone());
            index.insert(node.node_id.clone(), idx);
        }

        for edge in &plan.edges {
            if let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to))
                && graph.find_edge(from, to).is_none()
            {
                graph.add_edge(from, to, ());
            }
        }

        Self { graph, index }
    }

    /// Detect cycles (invalid plan)
    pub fn has_cycles(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Nodes without predecessors, in plan order
    pub fn roots(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Direct predecessors of `node`
    pub fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Direct dependents of `node`, in plan order
    pub fn dependents(&self, node: &NodeId) -> Vec<NodeId> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// Whether one node transitively depends on the other, so they never run together
    pub fn is_ordered(&self, first: &NodeId, second: &NodeId) -> bool {
        let (Some(&left), Some(&right)) = (self.index.get(first), self.index.get(second)) else {
            return false;
        };
        algo::has_path_connecting(&self.graph, left, right, None)
            || algo::has_path_connecting(&self.graph, right, left, None)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    fn neighbors(&self, node: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort_unstable();
        found
            .into_iter()
            .map(|neighbor| self.graph[neighbor].clone())
            .collect()
    }
}
