//! Liveness diagnostics for a ready queue that cannot make progress.
//!
//! The detector only reports; it never releases locks or changes node state.

use crate::locks::LockState;
use droidforge_core::{NodeId, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// What one blocked node is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDependency {
    pub node: NodeId,
    /// Claimed resources that are currently locked
    pub waiting_for: Vec<String>,
    /// Other nodes holding those resources, without duplicates
    pub held_by: Vec<NodeId>,
}

/// Diagnostic produced when nothing runs but nodes are ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockReport {
    pub blocked_nodes: Vec<NodeId>,
    pub lock_dependencies: Vec<LockDependency>,
    /// A cycle in the wait-for graph, if one exists
    pub cycle: Option<Vec<NodeId>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeadlockDetector;

impl DeadlockDetector {
    /// Analyse the ready queue. Returns `None` unless nothing is running and the queue is non-empty.
    pub fn detect(
        self,
        ready_queue: &[NodeId],
        running: &BTreeSet<NodeId>,
        nodes: &BTreeMap<NodeId, NodeState>,
        lock_state: &LockState,
    ) -> Option<DeadlockReport> {
        if !running.is_empty() || ready_queue.is_empty() {
            return None;
        }

        let lock_dependencies: Vec<LockDependency> = ready_queue
            .iter()
            .map(|node_id| Self::analyze(node_id, nodes, lock_state))
            .collect();
        let cycle = Self::find_cycle(&lock_dependencies);

        Some(DeadlockReport {
            blocked_nodes: ready_queue.to_vec(),
            lock_dependencies,
            cycle,
        })
    }

    /// True only when every blocked node claims something and all of its claims are locked.
    pub fn is_deadlock_likely(
        self,
        ready_queue: &[NodeId],
        running: &BTreeSet<NodeId>,
        nodes: &BTreeMap<NodeId, NodeState>,
        lock_state: &LockState,
    ) -> bool {
        if !running.is_empty() || ready_queue.is_empty() {
            return false;
        }

        ready_queue
            .iter()
            .filter_map(|node_id| nodes.get(node_id))
            .all(|state| {
                let claims = &state.spec.resource_claims;
                !claims.is_empty()
                    && claims
                        .iter()
                        .all(|resource| lock_state.contains_key(resource))
            })
    }

    fn analyze(
        node_id: &NodeId,
        nodes: &BTreeMap<NodeId, NodeState>,
        lock_state: &LockState,
    ) -> LockDependency {
        let mut waiting_for = Vec::new();
        let mut held_by: Vec<NodeId> = Vec::new();

        let claims = nodes
            .get(node_id)
            .map(|state| state.spec.resource_claims.as_slice())
            .unwrap_or_default();
        for resource in claims {
            if let Some(lock) = lock_state.get(resource) {
                waiting_for.push(resource.clone());
                for owner in &lock.owners {
                    if owner != node_id && !held_by.contains(owner) {
                        held_by.push(owner.clone());
                    }
                }
            }
        }

        LockDependency {
            node: node_id.clone(),
            waiting_for,
            held_by,
        }
    }

    fn find_cycle(dependencies: &[LockDependency]) -> Option<Vec<NodeId>> {
        let wait_for: HashMap<&NodeId, &[NodeId]> = dependencies
            .iter()
            .map(|dep| (&dep.node, dep.held_by.as_slice()))
            .collect();

        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        dependencies
            .iter()
            .find_map(|dep| Self::visit(&dep.node, &wait_for, &mut visited, &mut stack))
    }

    fn visit<'graph>(
        node: &'graph NodeId,
        wait_for: &HashMap<&'graph NodeId, &'graph [NodeId]>,
        visited: &mut HashSet<&'graph NodeId>,
        stack: &mut Vec<&'graph NodeId>,
    ) -> Option<Vec<NodeId>> {
        if let Some(start) = stack.iter().position(|&entry| entry == node) {
            return Some(stack[start..].iter().map(|&entry| entry.clone()).collect());
        }
        if !visited.insert(node) {
            return None;
        }

        stack.push(node);
        let neighbors = wait_for.get(node).copied().unwrap_or_default();
        for neighbor in neighbors {
            if let Some(cycle) = Self::visit(neighbor, wait_for, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::ResourceLockManager;
    use droidforge_core::{LockMode, NodeStatus, PlanNode};

    fn node_map(specs: &[(&str, &[&str])]) -> BTreeMap<NodeId, NodeState> {
        specs
            .iter()
            .map(|&(id, claims)| {
                let spec = PlanNode::new(id, "droid").with_claims(claims.iter().copied());
                (NodeId::from(id), NodeState::new(spec, NodeStatus::Ready))
            })
            .collect()
    }

    #[test]
    fn test_no_report_while_something_runs() {
        let nodes = node_map(&[("a", &["x"])]);
        let running: BTreeSet<NodeId> = [NodeId::from("b")].into_iter().collect();
        let report = DeadlockDetector.detect(
            &[NodeId::from("a")],
            &running,
            &nodes,
            &LockState::new(),
        );
        assert!(report.is_none());
    }

    #[test]
    fn test_report_lists_holders_and_cycle() {
        let nodes = node_map(&[("a", &["x", "y"]), ("b", &["y", "x"])]);
        let mut locks = ResourceLockManager::new();
        assert!(locks.try_acquire(&["x".to_owned()], LockMode::Write, &NodeId::from("b")));
        assert!(locks.try_acquire(&["y".to_owned()], LockMode::Write, &NodeId::from("a")));

        let ready = [NodeId::from("a"), NodeId::from("b")];
        let Some(report) =
            DeadlockDetector.detect(&ready, &BTreeSet::new(), &nodes, locks.lock_state())
        else {
            panic!("expected a deadlock report");
        };

        assert_eq!(report.blocked_nodes, ready.to_vec());
        assert_eq!(report.lock_dependencies[0].held_by, vec![NodeId::from("b")]);
        assert_eq!(
            report.lock_dependencies[0].waiting_for,
            vec!["x".to_owned(), "y".to_owned()]
        );
        assert_eq!(
            report.cycle,
            Some(vec![NodeId::from("a"), NodeId::from("b")])
        );
        assert!(DeadlockDetector.is_deadlock_likely(
            &ready,
            &BTreeSet::new(),
            &nodes,
            locks.lock_state()
        ));
    }

    #[test]
    fn test_unclaimed_node_makes_deadlock_unlikely() {
        let nodes = node_map(&[("a", &[]), ("b", &["x"])]);
        let mut locks = ResourceLockManager::new();
        assert!(locks.try_acquire(&["x".to_owned()], LockMode::Write, &NodeId::from("c")));

        let ready = [NodeId::from("a"), NodeId::from("b")];
        assert!(!DeadlockDetector.is_deadlock_likely(
            &ready,
            &BTreeSet::new(),
            &nodes,
            locks.lock_state()
        ));

        let Some(report) =
            DeadlockDetector.detect(&ready, &BTreeSet::new(), &nodes, locks.lock_state())
        else {
            panic!("expected a report");
        };
        assert!(report.cycle.is_none());
        assert!(report.lock_dependencies[0].waiting_for.is_empty());
    }
}
