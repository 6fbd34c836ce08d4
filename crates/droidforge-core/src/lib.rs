//! Core types, error handling and configuration for the DroidForge execution engine.
//!
//! This crate defines the vocabulary shared by every part of the engine:
//!
//! - **Identifiers**: [`ExecutionId`] and [`NodeId`]
//! - **Plans**: [`ExecutionPlan`], [`PlanNode`] and [`Edge`]
//! - **State**: [`ExecutionStatus`], [`NodeStatus`], [`NodeState`] and [`LockMode`]
//! - **Timeline**: [`TimelineEvent`] and [`EventKind`]
//! - **Errors**: [`ExecError`] and the [`Result`] alias
//! - **Configuration**: [`EngineConfig`] and its sections

/// Engine configuration loaded from TOML.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Execution plans, node specs and state enums.
pub mod plan;
/// Tracing subscriber setup.
pub mod telemetry;
/// Timeline events recorded for every state transition.
pub mod timeline;

pub use config::{EngineConfig, ExecutionConfig, HealthConfig, LoggingConfig, PersistenceConfig};
pub use error::{ExecError, Result};
pub use plan::{
    AdHocRequest, Edge, ExecutionId, ExecutionPlan, ExecutionStatus, LockMode, NodeId, NodeState,
    NodeStatus, PlanNode,
};
pub use timeline::{EventKind, TimelineEvent};
