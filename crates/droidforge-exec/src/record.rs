//! The in-memory execution record and the read-only views handed to callers.

use crate::deadlock::DeadlockReport;
use crate::graph::DependencyGraph;
use crate::health::ExecutionSummary;
use crate::locks::{ResourceLock, ResourceLockManager};
use crate::persistence::{PersistedExecution, PersistedNode};
use chrono::{DateTime, Utc};
use droidforge_core::{
    AdHocRequest, Edge, EventKind, ExecError, ExecutionId, ExecutionPlan, ExecutionStatus, NodeId,
    NodeState, NodeStatus, PlanNode, Result, TimelineEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// What a caller receives when a node is dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSchedule {
    pub node_id: NodeId,
    pub droid_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub resource_claims: Vec<String>,
    /// Private workspace provisioned for the node, when staging on dispatch is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_path: Option<PathBuf>,
}

/// Ad-hoc request outside any plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub repo_root: PathBuf,
    pub droid_id: String,
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub droid_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Read-only view of an execution returned by `poll` and `list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub repo_root: PathBuf,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub concurrency: usize,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<Edge>,
    pub ready_queue: Vec<NodeId>,
    pub running: Vec<NodeId>,
    pub locks: Vec<ResourceLock>,
    pub requests: Vec<AdHocRequest>,
    pub timeline: Vec<TimelineEvent>,
}

impl ExecutionSnapshot {
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| &node.node_id == node_id)
    }
}

/// Mutable state of one execution. Always accessed under its mutex.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionRecord {
    pub id: ExecutionId,
    pub repo_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub concurrency: usize,
    /// Node ids in plan order
    pub order: Vec<NodeId>,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub edges: Vec<Edge>,
    pub graph: DependencyGraph,
    pub ready_queue: Vec<NodeId>,
    pub running: BTreeSet<NodeId>,
    pub locks: ResourceLockManager,
    pub requests: Vec<AdHocRequest>,
    pub timeline: Vec<TimelineEvent>,
    /// Timeline entries before this index are already on disk and delivered
    pub committed: usize,
    /// Blocked set of the last recorded deadlock, to avoid repeating the entry on every poll
    pub last_deadlock: Option<Vec<NodeId>>,
}

impl ExecutionRecord {
    pub fn new(id: ExecutionId, repo_root: PathBuf, concurrency: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo_root,
            created_at: now,
            last_updated: now,
            status: ExecutionStatus::Planned,
            concurrency,
            order: Vec::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            graph: DependencyGraph::from_plan(&ExecutionPlan::default()),
            ready_queue: Vec::new(),
            running: BTreeSet::new(),
            locks: ResourceLockManager::new(),
            requests: Vec::new(),
            timeline: Vec::new(),
            committed: 0,
            last_deadlock: None,
        }
    }

    /// Replace the node set with `plan`; roots become ready, everything else pending.
    pub fn install_plan(&mut self, plan: &ExecutionPlan, graph: DependencyGraph, concurrency: usize) {
        self.concurrency = concurrency;
        self.order = plan.nodes.iter().map(|node| node.node_id.clone()).collect();
        self.edges.clone_from(&plan.edges);
        self.ready_queue.clear();
        self.running.clear();
        self.locks.clear();
        self.last_deadlock = None;
        self.nodes = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.clone(), NodeState::new(node.clone(), NodeStatus::Pending)))
            .collect();
        self.status = ExecutionStatus::Planned;

        for root in graph.roots() {
            self.mark_ready(root);
        }
        self.graph = graph;
    }

    pub fn push_event(&mut self, kind: EventKind, node_id: Option<NodeId>, payload: Option<Value>) {
        let mut event = TimelineEvent::new(self.id.clone(), kind).with_payload(payload);
        if let Some(node_id) = node_id {
            event = event.with_node(node_id);
        }
        self.last_updated = event.timestamp;
        self.timeline.push(event);
    }

    fn mark_ready(&mut self, node_id: NodeId) {
        if let Some(state) = self.nodes.get_mut(&node_id) {
            state.status = NodeStatus::Ready;
            self.ready_queue.push(node_id.clone());
            self.push_event(EventKind::TaskReady, Some(node_id), None);
        }
    }

    pub fn node(&self, node_id: &NodeId) -> Result<&NodeState> {
        self.nodes.get(node_id).ok_or_else(|| ExecError::UnknownNode {
            execution: self.id.clone(),
            node: node_id.clone(),
        })
    }

    pub fn require_running_node(&self, node_id: &NodeId) -> Result<&PlanNode> {
        let state = self.node(node_id)?;
        if state.status == NodeStatus::Running {
            Ok(&state.spec)
        } else {
            Err(ExecError::NodeNotRunning {
                node: node_id.clone(),
                status: state.status,
            })
        }
    }

    /// Move a node to its final status, dropping it from the running set and releasing its claims.
    pub fn finish_node(&mut self, node_id: &NodeId, status: NodeStatus) -> Option<NodeState> {
        let state = self.nodes.get_mut(node_id)?;
        state.status = status;
        state.finished_at = Some(Utc::now());
        let finished = state.clone();

        self.running.remove(node_id);
        self.locks.release(&finished.spec.sorted_claims(), node_id);
        Some(finished)
    }

    /// Promote every pending dependent of `node_id` whose predecessors have all completed.
    pub fn promote_dependents(&mut self, node_id: &NodeId) -> Vec<NodeId> {
        let mut promoted = Vec::new();
        for dependent in self.graph.dependents(node_id) {
            let pending = self
                .nodes
                .get(&dependent)
                .is_some_and(|state| state.status == NodeStatus::Pending);
            let unblocked = self.graph.predecessors(&dependent).iter().all(|pred| {
                self.nodes
                    .get(pred)
                    .is_some_and(|state| state.status == NodeStatus::Completed)
            });
            if pending && unblocked {
                promoted.push(dependent.clone());
                self.mark_ready(dependent);
            }
        }
        promoted
    }

    pub fn all_completed(&self) -> bool {
        self.nodes
            .values()
            .all(|state| state.status == NodeStatus::Completed)
    }

    /// Completed nodes in plan order with the claims they were planned with.
    pub fn completed_claims(&self) -> Vec<(NodeId, Vec<String>)> {
        self.order
            .iter()
            .filter_map(|node_id| {
                self.nodes
                    .get(node_id)
                    .filter(|state| state.status == NodeStatus::Completed)
                    .map(|state| (node_id.clone(), state.spec.resource_claims.clone()))
            })
            .collect()
    }

    pub fn uncommitted_events(&self) -> &[TimelineEvent] {
        self.timeline.get(self.committed..).unwrap_or_default()
    }

    pub fn deadlock_payload(report: &DeadlockReport) -> Option<Value> {
        serde_json::to_value(report).ok()
    }

    pub fn to_persisted(&self) -> PersistedExecution {
        PersistedExecution {
            id: self.id.clone(),
            repo_root: self.repo_root.clone(),
            created_at: self.created_at,
            last_updated: self.last_updated,
            status: self.status,
            concurrency: self.concurrency,
            nodes: self
                .order
                .iter()
                .filter_map(|node_id| {
                    self.nodes.get(node_id).map(|state| PersistedNode {
                        node_id: node_id.clone(),
                        state: state.clone(),
                    })
                })
                .collect(),
            edges: self.edges.clone(),
            ready_queue: self.ready_queue.clone(),
            running: self.running.iter().cloned().collect(),
            locks: self.locks.entries(),
            requests: self.requests.clone(),
        }
    }

    /// Rebuild a record from disk. Every event in `timeline` counts as committed.
    pub fn from_persisted(persisted: PersistedExecution, timeline: Vec<TimelineEvent>) -> Self {
        let plan = ExecutionPlan {
            nodes: persisted
                .nodes
                .iter()
                .map(|node| node.state.spec.clone())
                .collect(),
            edges: persisted.edges.clone(),
            concurrency: Some(persisted.concurrency),
        };
        let committed = timeline.len();

        Self {
            id: persisted.id,
            repo_root: persisted.repo_root,
            created_at: persisted.created_at,
            last_updated: persisted.last_updated,
            status: persisted.status,
            concurrency: persisted.concurrency,
            order: persisted
                .nodes
                .iter()
                .map(|node| node.node_id.clone())
                .collect(),
            nodes: persisted
                .nodes
                .into_iter()
                .map(|node| (node.node_id, node.state))
                .collect(),
            edges: persisted.edges,
            graph: DependencyGraph::from_plan(&plan),
            ready_queue: persisted.ready_queue,
            running: persisted.running.into_iter().collect(),
            locks: ResourceLockManager::from_entries(persisted.locks),
            requests: persisted.requests,
            timeline,
            committed,
            last_deadlock: None,
        }
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.id.clone(),
            repo_root: self.repo_root.clone(),
            status: self.status,
            created_at: self.created_at,
            last_updated: self.last_updated,
            concurrency: self.concurrency,
            nodes: self
                .order
                .iter()
                .filter_map(|node_id| self.nodes.get(node_id))
                .map(|state| NodeSnapshot {
                    node_id: state.spec.node_id.clone(),
                    droid_id: state.spec.droid_id.clone(),
                    title: state.spec.title.clone(),
                    status: state.status,
                    started_at: state.started_at,
                    finished_at: state.finished_at,
                })
                .collect(),
            edges: self.edges.clone(),
            ready_queue: self.ready_queue.clone(),
            running: self.running.iter().cloned().collect(),
            locks: self.locks.entries(),
            requests: self.requests.clone(),
            timeline: self.timeline.clone(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            status: self.status,
            last_updated: self.last_updated,
            running_nodes: self.running.len(),
            ready_nodes: self.ready_queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidforge_core::LockMode;

    fn planned_record() -> ExecutionRecord {
        let plan = ExecutionPlan::new(vec![
            PlanNode::new("plan", "df-planner"),
            PlanNode::new("build", "df-builder").with_claims(["src/**"]),
            PlanNode::new("test", "df-tester").with_claims(["tests/**"]),
        ])
        .with_edge("plan", "build")
        .with_edge("plan", "test");
        let mut record = ExecutionRecord::new(ExecutionId::from("exec-r"), PathBuf::from("/repo"), 2);
        let graph = DependencyGraph::from_plan(&plan);
        record.install_plan(&plan, graph, 2);
        record
    }

    #[test]
    fn test_install_plan_marks_roots_ready() {
        let record = planned_record();
        assert_eq!(record.ready_queue, vec![NodeId::from("plan")]);
        assert_eq!(
            record.node(&NodeId::from("build")).map(|state| state.status).ok(),
            Some(NodeStatus::Pending)
        );
        assert_eq!(record.uncommitted_events().len(), 1);
    }

    #[test]
    fn test_finish_and_promote() {
        let mut record = planned_record();
        let plan_id = NodeId::from("plan");
        if let Some(state) = record.nodes.get_mut(&plan_id) {
            state.status = NodeStatus::Running;
        }
        record.ready_queue.clear();
        record.running.insert(plan_id.clone());

        assert!(record.finish_node(&plan_id, NodeStatus::Completed).is_some());
        let promoted = record.promote_dependents(&plan_id);
        assert_eq!(promoted, vec![NodeId::from("build"), NodeId::from("test")]);
        assert!(record.running.is_empty());
        assert!(!record.all_completed());
    }

    #[test]
    fn test_persisted_round_trip_keeps_locks_and_order() {
        let mut record = planned_record();
        let build = NodeId::from("build");
        assert!(record.locks.try_acquire(&["src/**".to_owned()], LockMode::Write, &build));

        let persisted = record.to_persisted();
        let restored = ExecutionRecord::from_persisted(persisted, record.timeline.clone());

        assert_eq!(restored.order, record.order);
        assert_eq!(restored.locks.lock_state(), record.locks.lock_state());
        assert_eq!(restored.graph.dependents(&NodeId::from("plan")).len(), 2);
        assert!(restored.uncommitted_events().is_empty());
    }

    #[test]
    fn test_require_running_node() {
        let record = planned_record();
        let result = record.require_running_node(&NodeId::from("plan"));
        assert!(matches!(result, Err(ExecError::NodeNotRunning { .. })));
        let missing = record.require_running_node(&NodeId::from("ghost"));
        assert!(matches!(missing, Err(ExecError::UnknownNode { .. })));
    }
}
