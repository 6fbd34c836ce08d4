//! Execution plans, node specifications and the status enums of the state machine.

use crate::error::{ExecError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};
use uuid::Uuid;

/// Ids name directories under the state dir, so each must be exactly one normal path component.
fn is_single_component(value: &str) -> bool {
    if value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == value
    )
}

/// Unique identifier for an execution (`exec-<uuid>` when generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Generates a fresh execution id.
    pub fn generate() -> Self {
        Self(format!("exec-{}", Uuid::new_v4()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks the id can name an execution directory.
    ///
    /// # Errors
    /// Returns `InvalidPlan` for an empty id, `.`, `..`, or an id containing a separator.
    pub fn ensure_path_safe(&self) -> Result<()> {
        if is_single_component(&self.0) {
            Ok(())
        } else {
            Err(ExecError::InvalidPlan(format!(
                "execution id {:?} is not a plain directory name",
                self.0
            )))
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Caller-assigned identifier of a node within one plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can name a staging directory.
    pub fn is_path_safe(&self) -> bool {
        is_single_component(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Access mode requested for a node's resource claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Shared read access
    Read,
    /// Exclusive write access
    #[default]
    Write,
    /// Shared analysis access, compatible with readers
    Analysis,
}

impl LockMode {
    /// Whether this mode excludes every other holder.
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Whether a lock currently held in `self` mode admits a new holder in `requested` mode.
    pub fn admits(self, requested: Self) -> bool {
        !self.is_exclusive() && !requested.is_exclusive()
    }

    /// Lowercase wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Execution status: `planned → running → {paused ⇄ running} → completed | failed | aborted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Plan accepted, not yet started
    Planned,
    /// Dispatching nodes
    Running,
    /// Dispatch suspended; running nodes are unaffected
    Paused,
    /// Every node completed
    Completed,
    /// A node failed
    Failed,
    /// Aborted by the caller
    Aborted,
}

impl ExecutionStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Lowercase wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Waiting on at least one predecessor
    Pending,
    /// All predecessors completed; waiting for dispatch
    Ready,
    /// Dispatched to a droid
    Running,
    /// Reported as completed
    Completed,
    /// Reported as failed
    Failed,
}

impl NodeStatus {
    /// Lowercase wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    /// Unique id within the plan
    pub node_id: NodeId,
    /// Droid that performs the work
    pub droid_id: String,
    /// Short title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lock mode for the claims (write when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<LockMode>,
    /// Glob patterns naming the files this node will touch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_claims: Vec<String>,
    /// Free-form caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PlanNode {
    /// Creates a node with no claims.
    pub fn new(node_id: impl Into<NodeId>, droid_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            droid_id: droid_id.into(),
            title: None,
            description: None,
            mode: None,
            resource_claims: Vec::default(),
            metadata: None,
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the lock mode.
    #[must_use]
    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the resource claims.
    #[must_use]
    pub fn with_claims<I, S>(mut self, claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_claims = claims.into_iter().map(Into::into).collect();
        self
    }

    /// Effective lock mode.
    pub fn lock_mode(&self) -> LockMode {
        self.mode.unwrap_or_default()
    }

    /// Claims in canonical lexical order without duplicates.
    pub fn sorted_claims(&self) -> Vec<String> {
        let mut claims = self.resource_claims.clone();
        claims.sort();
        claims.dedup();
        claims
    }
}

/// Dependency edge: `to` may not start before `from` completes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Predecessor
    pub from: NodeId,
    /// Dependent
    pub to: NodeId,
}

impl Edge {
    /// Creates an edge.
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Nodes, dependency edges and an optional concurrency cap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Nodes in submission order
    pub nodes: Vec<PlanNode>,
    /// Dependency edges
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Maximum number of simultaneously running nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl ExecutionPlan {
    /// Creates a plan with no edges.
    pub fn new(nodes: Vec<PlanNode>) -> Self {
        Self {
            nodes,
            edges: Vec::default(),
            concurrency: None,
        }
    }

    /// Adds a dependency edge.
    #[must_use]
    pub fn with_edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    /// Sets the concurrency cap.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Checks node ids and edge endpoints.
    ///
    /// Cycle detection needs the dependency graph and is done by the scheduler.
    ///
    /// # Errors
    /// Returns `InvalidPlan` for an empty plan, an empty or duplicate node id, a node
    /// id that is not a single path component, or an edge that references a node not
    /// in the plan.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ExecError::InvalidPlan("plan has no nodes".to_owned()));
        }

        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.node_id.as_str().is_empty() {
                return Err(ExecError::InvalidPlan("node id must not be empty".to_owned()));
            }
            if !node.node_id.is_path_safe() {
                return Err(ExecError::InvalidPlan(format!(
                    "node id {:?} is not a plain directory name",
                    node.node_id.as_str()
                )));
            }
            if !seen.insert(&node.node_id) {
                return Err(ExecError::InvalidPlan(format!(
                    "duplicate node id: {}",
                    node.node_id
                )));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !seen.contains(endpoint) {
                    return Err(ExecError::InvalidPlan(format!(
                        "edge {} -> {} references unknown node {endpoint}",
                        edge.from, edge.to
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A node's spec plus its mutable scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Immutable spec from the plan
    pub spec: PlanNode,
    /// Current status
    pub status: NodeStatus,
    /// When the node was dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When completion or failure was reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    /// Creates a node state with no timestamps.
    pub fn new(spec: PlanNode, status: NodeStatus) -> Self {
        Self {
            spec,
            status,
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall time between dispatch and the final report, if both happened.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

/// Free-form invocation recorded outside the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdHocRequest {
    /// Droid the request is addressed to
    pub droid_id: String,
    /// Request text
    pub request: String,
    /// When the request was recorded
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, json, to_value};

    #[test]
    fn test_lock_mode_compatibility() {
        assert!(LockMode::Read.admits(LockMode::Read));
        assert!(LockMode::Read.admits(LockMode::Analysis));
        assert!(LockMode::Analysis.admits(LockMode::Read));
        assert!(LockMode::Analysis.admits(LockMode::Analysis));
        assert!(!LockMode::Read.admits(LockMode::Write));
        assert!(!LockMode::Write.admits(LockMode::Read));
        assert!(!LockMode::Write.admits(LockMode::Write));
        assert!(!LockMode::Analysis.admits(LockMode::Write));
    }

    #[test]
    fn test_default_mode_is_write() {
        let node = PlanNode::new("build", "droid-builder");
        assert_eq!(node.lock_mode(), LockMode::Write);
    }

    #[test]
    fn test_sorted_claims_canonical() {
        let node = PlanNode::new("a", "droid").with_claims(["f2", "f1", "f2"]);
        assert_eq!(node.sorted_claims(), vec!["f1".to_owned(), "f2".to_owned()]);
    }

    #[test]
    fn test_plan_wire_format() {
        let plan: ExecutionPlan = match from_str(
            r#"{
                "nodes": [
                    {"nodeId": "plan", "droidId": "df-planner"},
                    {"nodeId": "build", "droidId": "df-builder", "mode": "read",
                     "resourceClaims": ["src/**"]}
                ],
                "edges": [{"from": "plan", "to": "build"}],
                "concurrency": 2
            }"#,
        ) {
            Ok(plan) => plan,
            Err(error) => panic!("failed to parse plan: {error}"),
        };

        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.nodes[1].lock_mode(), LockMode::Read);
        assert_eq!(plan.edges[0], Edge::new("plan", "build"));
        assert_eq!(plan.concurrency, Some(2));

        let value = match to_value(&plan.nodes[0]) {
            Ok(value) => value,
            Err(error) => panic!("failed to serialize node: {error}"),
        };
        assert_eq!(value, json!({"nodeId": "plan", "droidId": "df-planner"}));
    }

    #[test]
    fn test_validate_rejects_unknown_edge_target() {
        let plan = ExecutionPlan::new(vec![PlanNode::new("plan", "droid")]).with_edge("plan", "ghost");
        let result = plan.validate();
        assert!(matches!(result, Err(ExecError::InvalidPlan(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let plan = ExecutionPlan::new(vec![
            PlanNode::new("plan", "droid"),
            PlanNode::new("plan", "other"),
        ]);
        assert!(matches!(plan.validate(), Err(ExecError::InvalidPlan(_))));
    }

    #[test]
    fn test_validate_rejects_empty_plan() {
        assert!(matches!(
            ExecutionPlan::default().validate(),
            Err(ExecError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_validate_rejects_node_ids_that_escape_staging() {
        for bad in ["..", ".", "../outside", "nested/node", "back\\slash", "/abs"] {
            let plan = ExecutionPlan::new(vec![PlanNode::new(bad, "droid")]);
            assert!(
                matches!(plan.validate(), Err(ExecError::InvalidPlan(_))),
                "{bad} should be rejected"
            );
        }
        let plan = ExecutionPlan::new(vec![PlanNode::new("build.v2", "droid")]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_execution_id_path_safety() {
        assert!(ExecutionId::generate().ensure_path_safe().is_ok());
        assert!(ExecutionId::from("exec-1").ensure_path_safe().is_ok());
        for bad in ["", ".", "..", "../..", "a/b", "/tmp"] {
            assert!(
                matches!(
                    ExecutionId::from(bad).ensure_path_safe(),
                    Err(ExecError::InvalidPlan(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_generated_execution_ids_are_unique() {
        let first = ExecutionId::generate();
        let second = ExecutionId::generate();
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("exec-"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Planned.is_terminal());
    }
}
