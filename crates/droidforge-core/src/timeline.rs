//! Timeline events: immutable, append-only records of state transitions.

use crate::plan::{ExecutionId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of a timeline event; the serialized form is the dotted event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A plan was accepted
    #[serde(rename = "execution.planned")]
    ExecutionPlanned,
    /// The execution started dispatching
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    /// Every node completed
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    /// Dispatch was paused
    #[serde(rename = "execution.paused")]
    ExecutionPaused,
    /// Dispatch was resumed
    #[serde(rename = "execution.resumed")]
    ExecutionResumed,
    /// The execution was aborted
    #[serde(rename = "execution.aborted")]
    ExecutionAborted,
    /// A node failure failed the execution
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    /// The liveness detector found a stalled ready queue
    #[serde(rename = "execution.deadlock")]
    ExecutionDeadlock,
    /// Staged outputs were merged into the repository
    #[serde(rename = "execution.merged")]
    ExecutionMerged,
    /// A node became ready
    #[serde(rename = "task.ready")]
    TaskReady,
    /// A node was dispatched
    #[serde(rename = "task.started")]
    TaskStarted,
    /// A node completed
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// A node failed
    #[serde(rename = "task.failed")]
    TaskFailed,
    /// An ad-hoc request was recorded
    #[serde(rename = "request.received")]
    RequestReceived,
}

impl EventKind {
    /// Dotted event name as written to the timeline.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionPlanned => "execution.planned",
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionPaused => "execution.paused",
            Self::ExecutionResumed => "execution.resumed",
            Self::ExecutionAborted => "execution.aborted",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionDeadlock => "execution.deadlock",
            Self::ExecutionMerged => "execution.merged",
            Self::TaskReady => "task.ready",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::RequestReceived => "request.received",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One entry of an execution's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// Execution the event belongs to
    pub execution_id: ExecutionId,
    /// Node the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Event kind
    pub event: EventKind,
    /// Optional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl TimelineEvent {
    /// Creates an event stamped with the current time.
    pub fn new(execution_id: ExecutionId, event: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            execution_id,
            node_id: None,
            event,
            payload: None,
        }
    }

    /// Attaches the node the event concerns.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Attaches a payload; `None` leaves the event without one.
    #[must_use]
    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, json, to_string};

    #[test]
    fn test_event_kind_wire_names() {
        let json = match to_string(&EventKind::TaskCompleted) {
            Ok(json) => json,
            Err(error) => panic!("serialize failed: {error}"),
        };
        assert_eq!(json, "\"task.completed\"");
        assert_eq!(EventKind::RequestReceived.as_str(), "request.received");
    }

    #[test]
    fn test_timeline_event_line_format() {
        let event = TimelineEvent::new(ExecutionId::from("exec-1"), EventKind::TaskStarted)
            .with_node(NodeId::from("build"))
            .with_payload(Some(json!({"droidId": "df-builder"})));

        let line = match to_string(&event) {
            Ok(line) => line,
            Err(error) => panic!("serialize failed: {error}"),
        };
        assert!(line.contains("\"executionId\":\"exec-1\""));
        assert!(line.contains("\"event\":\"task.started\""));
        assert!(line.contains("\"nodeId\":\"build\""));

        let parsed: TimelineEvent = match from_str(&line) {
            Ok(parsed) => parsed,
            Err(error) => panic!("deserialize failed: {error}"),
        };
        assert_eq!(parsed, event);
    }
}
