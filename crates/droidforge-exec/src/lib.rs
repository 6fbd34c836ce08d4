//! Parallel execution engine for DroidForge.
//!
//! The [`ExecutionManager`] turns a dependency plan into a stream of
//! dispatchable nodes. It never runs them: droids poll for work, run it in a
//! private staging copy of the repository, and report back. Resource claims
//! are arbitrated by a per-execution [`ResourceLockManager`], staged outputs
//! are folded back by the [`ExecutionMerger`], and every mutation is written
//! through to `.droidforge/exec/<id>/`.

pub mod claims;
pub mod deadlock;
pub mod events;
pub mod fs_util;
pub mod graph;
pub mod health;
pub mod layout;
pub mod locks;
pub mod manager;
pub mod merger;
pub mod metrics;
pub mod persistence;
pub mod record;
pub mod staging;
pub mod tools;

pub use claims::{ClaimOverlap, ResourceMatcher};
pub use deadlock::{DeadlockDetector, DeadlockReport, LockDependency};
pub use events::{ExecutionEventBus, Listener};
pub use graph::DependencyGraph;
pub use health::{ExecutionSummary, HealthChecker, HealthStatus, StalledExecution, format_duration};
pub use layout::ExecLayout;
pub use locks::{LockState, ResourceLock, ResourceLockManager};
pub use manager::ExecutionManager;
pub use merger::{ChangeSet, ExecutionMerger, FileChange, MergeResult};
pub use metrics::{ExecutionMetrics, MetricsCollector};
pub use persistence::{ExecutionPersistence, PersistedExecution, PersistedNode};
pub use record::{EnqueueRequest, ExecutionSnapshot, NodeSchedule, NodeSnapshot};
pub use staging::{CollectedChanges, StagingArea, StagingManager};
pub use tools::{
    ActivityLog, CompleteTaskInput, ExecutionListing, ExecutionRef, ExecutionTools,
    ListExecutionsInput, ListExecutionsOutput, LogRecord, LogStatus, MergeOutput, NextTaskOutput,
    PlanExecutionInput, StatusOutput, TaskOutcome,
};
