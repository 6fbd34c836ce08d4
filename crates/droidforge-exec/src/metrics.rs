//! Per-execution timing, contention and concurrency counters.

use chrono::{DateTime, Utc};
use droidforge_core::{ExecutionId, NodeId, NodeState, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Computed metrics for one execution. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub node_count: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub average_node_duration_ms: f64,
    pub max_node_duration_ms: i64,
    pub min_node_duration_ms: i64,
    pub lock_contention_events: usize,
    pub peak_concurrency: usize,
    pub current_concurrency: usize,
}

#[derive(Debug, Clone)]
struct Tracked {
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    node_count: usize,
    completed_nodes: usize,
    failed_nodes: usize,
    lock_contention_events: usize,
    peak_concurrency: usize,
    current_concurrency: usize,
    node_durations: HashMap<NodeId, i64>,
}

impl Tracked {
    fn new(node_count: usize) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            node_count,
            completed_nodes: 0,
            failed_nodes: 0,
            lock_contention_events: 0,
            peak_concurrency: 0,
            current_concurrency: 0,
            node_durations: HashMap::new(),
        }
    }

    fn compute(&self, execution_id: &ExecutionId) -> ExecutionMetrics {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let durations: Vec<i64> = self.node_durations.values().copied().collect();
        let average = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        };

        ExecutionMetrics {
            execution_id: execution_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: (end - self.started_at).num_milliseconds(),
            node_count: self.node_count,
            completed_nodes: self.completed_nodes,
            failed_nodes: self.failed_nodes,
            average_node_duration_ms: average,
            max_node_duration_ms: durations.iter().copied().max().unwrap_or(0),
            min_node_duration_ms: durations.iter().copied().min().unwrap_or(0),
            lock_contention_events: self.lock_contention_events,
            peak_concurrency: self.peak_concurrency,
            current_concurrency: self.current_concurrency,
        }
    }
}

/// Collects metrics fed by the execution manager. Unknown executions are ignored.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    tracked: Mutex<HashMap<ExecutionId, Tracked>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<ExecutionId, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<F>(&self, execution_id: &ExecutionId, update: F)
    where
        F: FnOnce(&mut Tracked),
    {
        if let Some(tracked) = self.tracked().get_mut(execution_id) {
            update(tracked);
        }
    }

    /// Start tracking an execution, resetting any previous counters.
    pub fn record_execution_start(&self, execution_id: &ExecutionId, node_count: usize) {
        self.tracked()
            .insert(execution_id.clone(), Tracked::new(node_count));
    }

    /// Resume tracking an execution rebuilt from disk, seeded from its node states.
    pub fn record_execution_recovered<'state, I>(
        &self,
        execution_id: &ExecutionId,
        started_at: DateTime<Utc>,
        nodes: I,
    ) where
        I: IntoIterator<Item = &'state NodeState>,
    {
        let mut tracked = Tracked::new(0);
        tracked.started_at = started_at;
        for state in nodes {
            tracked.node_count += 1;
            match state.status {
                NodeStatus::Completed => {
                    tracked.completed_nodes += 1;
                    if let Some(duration) = state.duration() {
                        tracked
                            .node_durations
                            .insert(state.spec.node_id.clone(), duration.num_milliseconds());
                    }
                }
                NodeStatus::Failed => tracked.failed_nodes += 1,
                NodeStatus::Running => tracked.current_concurrency += 1,
                NodeStatus::Pending | NodeStatus::Ready => {}
            }
        }
        tracked.peak_concurrency = tracked.current_concurrency;
        self.tracked().insert(execution_id.clone(), tracked);
    }

    pub fn record_execution_complete(&self, execution_id: &ExecutionId) {
        self.with(execution_id, |tracked| {
            tracked.finished_at = Some(Utc::now());
            tracked.current_concurrency = 0;
        });
    }

    pub fn record_task_start(&self, execution_id: &ExecutionId) {
        self.with(execution_id, |tracked| {
            tracked.current_concurrency += 1;
            tracked.peak_concurrency = tracked.peak_concurrency.max(tracked.current_concurrency);
        });
    }

    pub fn record_task_complete(&self, execution_id: &ExecutionId, node_id: &NodeId, duration_ms: i64) {
        self.with(execution_id, |tracked| {
            tracked.node_durations.insert(node_id.clone(), duration_ms);
            tracked.completed_nodes += 1;
            tracked.current_concurrency = tracked.current_concurrency.saturating_sub(1);
        });
    }

    pub fn record_task_failed(&self, execution_id: &ExecutionId) {
        self.with(execution_id, |tracked| {
            tracked.failed_nodes += 1;
            tracked.current_concurrency = tracked.current_concurrency.saturating_sub(1);
        });
    }

    pub fn record_lock_contention(&self, execution_id: &ExecutionId) {
        self.with(execution_id, |tracked| tracked.lock_contention_events += 1);
    }

    /// Overwrite the current concurrency, raising the peak if needed.
    pub fn update_concurrency(&self, execution_id: &ExecutionId, concurrency: usize) {
        self.with(execution_id, |tracked| {
            tracked.current_concurrency = concurrency;
            tracked.peak_concurrency = tracked.peak_concurrency.max(concurrency);
        });
    }

    pub fn metrics(&self, execution_id: &ExecutionId) -> Option<ExecutionMetrics> {
        self.tracked()
            .get(execution_id)
            .map(|tracked| tracked.compute(execution_id))
    }

    /// Metrics of every tracked execution, ordered by id.
    pub fn all_metrics(&self) -> Vec<ExecutionMetrics> {
        let mut all: Vec<ExecutionMetrics> = self
            .tracked()
            .iter()
            .map(|(id, tracked)| tracked.compute(id))
            .collect();
        all.sort_by(|left, right| left.execution_id.cmp(&right.execution_id));
        all
    }

    pub fn clear(&self, execution_id: &ExecutionId) {
        self.tracked().remove(execution_id);
    }

    pub fn clear_all(&self) {
        self.tracked().clear();
    }
}
