//! Error types for the execution engine.

use crate::plan::{ExecutionId, ExecutionStatus, NodeId, NodeStatus};
use glob::PatternError;
use serde_json::Error as JsonError;
use std::io;
use std::path::PathBuf;
use std::result::Result as StdResult;
use thiserror::Error;
use tokio::task::JoinError;

/// Result type alias using `ExecError`.
pub type Result<T> = StdResult<T, ExecError>;

/// Error types that can occur while planning, scheduling, staging or merging.
///
/// Lock unavailability and merge conflicts are deliberately absent: both are
/// reported as data (`false`/`None` and a conflict list) rather than errors.
#[derive(Debug, Error)]
pub enum ExecError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] JsonError),

    /// A resource claim is not a valid glob pattern
    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] PatternError),

    /// A blocking filesystem job could not be joined
    #[error("Background job failed: {0}")]
    Background(#[from] JoinError),

    /// No execution with this id is known
    #[error("Unknown execution: {0}")]
    UnknownExecution(ExecutionId),

    /// The execution exists but has no node with this id
    #[error("Unknown node {node} in execution {execution}")]
    UnknownNode {
        /// Execution that was searched
        execution: ExecutionId,
        /// Node that was not found
        node: NodeId,
    },

    /// The submitted plan is malformed
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// The submitted plan contains a dependency cycle
    #[error("Cyclic dependency detected in execution plan")]
    CyclicPlan,

    /// A status transition was requested that the state machine forbids
    #[error("Cannot {action} execution {execution} in status {status}")]
    InvalidTransition {
        /// Execution being transitioned
        execution: ExecutionId,
        /// Current status
        status: ExecutionStatus,
        /// Operation that was attempted
        action: &'static str,
    },

    /// Completion was reported for a node that is not running
    #[error("Node {node} is not running (status: {status})")]
    NodeNotRunning {
        /// Node that was reported
        node: NodeId,
        /// Its current status
        status: NodeStatus,
    },

    /// A path escapes the repository root
    #[error("Unsafe relative path: {}", .0.display())]
    UnsafePath(PathBuf),

    /// Configuration is invalid or unreadable
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tool call named no known tool
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl ExecError {
    /// Checks whether the error was caused by caller input rather than the environment.
    ///
    /// Input errors never leave partial state behind, so the caller can fix the
    /// request and try again.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::UnknownExecution(_)
                | Self::UnknownNode { .. }
                | Self::InvalidPlan(_)
                | Self::CyclicPlan
                | Self::InvalidTransition { .. }
                | Self::NodeNotRunning { .. }
                | Self::Glob(_)
                | Self::UnknownTool(_)
        )
    }

    /// Checks whether this is an IO "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }
}
