//! Stalled-execution detection across the manager's registry.

use chrono::{DateTime, Duration, Utc};
use droidforge_core::{ExecError, ExecutionId, ExecutionStatus, Result};
use serde::{Deserialize, Serialize};

/// Just enough of an execution to judge its health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
    pub last_updated: DateTime<Utc>,
    pub running_nodes: usize,
    pub ready_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledExecution {
    pub id: ExecutionId,
    pub reason: String,
    pub last_updated: DateTime<Utc>,
    pub stalled_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub active_executions: usize,
    pub paused_executions: usize,
    pub completed_executions: usize,
    /// Failed and aborted executions
    pub failed_executions: usize,
    pub stalled_executions: Vec<StalledExecution>,
    pub uptime_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Flags running executions that have not changed for longer than a threshold
#[derive(Debug, Clone)]
pub struct HealthChecker {
    stalled_threshold: Duration,
    started_at: DateTime<Utc>,
}

impl HealthChecker {
    /// # Errors
    /// Returns `Config` when the threshold is zero.
    pub fn new(stalled_threshold_secs: u64) -> Result<Self> {
        let mut checker = Self {
            stalled_threshold: Duration::zero(),
            started_at: Utc::now(),
        };
        checker.set_stalled_threshold(stalled_threshold_secs)?;
        Ok(checker)
    }

    /// # Errors
    /// Returns `Config` when the threshold is zero or out of range.
    pub fn set_stalled_threshold(&mut self, seconds: u64) -> Result<()> {
        let threshold = i64::try_from(seconds)
            .ok()
            .filter(|&secs| secs > 0)
            .and_then(Duration::try_seconds)
            .ok_or_else(|| ExecError::Config("Stalled threshold must be positive".to_owned()))?;
        self.stalled_threshold = threshold;
        Ok(())
    }

    pub fn stalled_threshold(&self) -> Duration {
        self.stalled_threshold
    }

    pub fn check(&self, executions: &[ExecutionSummary], now: DateTime<Utc>) -> HealthStatus {
        let count = |wanted: &[ExecutionStatus]| {
            executions
                .iter()
                .filter(|summary| wanted.contains(&summary.status))
                .count()
        };

        let stalled_executions: Vec<StalledExecution> = executions
            .iter()
            .filter(|summary| summary.status == ExecutionStatus::Running)
            .filter_map(|summary| {
                let idle = now - summary.last_updated;
                (idle > self.stalled_threshold).then(|| StalledExecution {
                    id: summary.id.clone(),
                    reason: Self::stall_reason(summary),
                    last_updated: summary.last_updated,
                    stalled_ms: idle.num_milliseconds(),
                })
            })
            .collect();

        if !stalled_executions.is_empty() {
            tracing::warn!("{} executions stalled", stalled_executions.len());
        }

        HealthStatus {
            healthy: stalled_executions.is_empty(),
            active_executions: count(&[ExecutionStatus::Running]),
            paused_executions: count(&[ExecutionStatus::Paused]),
            completed_executions: count(&[ExecutionStatus::Completed]),
            failed_executions: count(&[ExecutionStatus::Failed, ExecutionStatus::Aborted]),
            stalled_executions,
            uptime_ms: (now - self.started_at).num_milliseconds(),
            timestamp: now,
        }
    }

    fn stall_reason(summary: &ExecutionSummary) -> String {
        match (summary.running_nodes, summary.ready_nodes) {
            (0, 0) => "No running or ready tasks".to_owned(),
            (0, ready) => format!("{ready} tasks ready but none scheduled"),
            (running, _) => format!("{running} tasks running but no progress"),
        }
    }
}

/// Render a duration as `1d 2h`, `3h 4m`, `5m 6s` or `7s`.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{days}d {}h", hours % 24)
    } else if hours > 0 {
        format!("{hours}h {}m", minutes % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}
