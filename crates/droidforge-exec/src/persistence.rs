//! Durable execution state.
//!
//! Every execution owns `state.json` (a full snapshot, replaced atomically) and
//! `timeline.jsonl` (append-only, one event per line). The files on disk are
//! the ground truth a crashed process recovers from.

use crate::fs_util::{remove_dir_if_exists, write_atomic};
use crate::layout::{ExecLayout, STATE_FILE};
use crate::locks::ResourceLock;
use chrono::{DateTime, Utc};
use droidforge_core::{
    AdHocRequest, Edge, ExecutionId, ExecutionStatus, NodeId, NodeState, Result, TimelineEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_vec_pretty};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt as _;

/// A node as written to `state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub state: NodeState,
}

/// Snapshot of one execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedExecution {
    pub id: ExecutionId,
    pub repo_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub concurrency: usize,
    /// Nodes in plan order
    pub nodes: Vec<PersistedNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub ready_queue: Vec<NodeId>,
    #[serde(default)]
    pub running: Vec<NodeId>,
    #[serde(default)]
    pub locks: Vec<ResourceLock>,
    #[serde(default)]
    pub requests: Vec<AdHocRequest>,
}

impl PersistedExecution {
    /// Claims of `node_id` as recorded in the snapshot
    pub fn claims_of(&self, node_id: &NodeId) -> Vec<String> {
        self.nodes
            .iter()
            .find(|node| &node.node_id == node_id)
            .map(|node| node.state.spec.resource_claims.clone())
            .unwrap_or_default()
    }
}

/// Reads and writes execution state under a repository
#[derive(Debug, Clone, Default)]
pub struct ExecutionPersistence {
    layout: ExecLayout,
}

impl ExecutionPersistence {
    pub fn new(layout: ExecLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ExecLayout {
        &self.layout
    }

    /// Replace `state.json` and append `new_events` to the timeline.
    ///
    /// # Errors
    /// Returns an error if serialization or either write fails.
    pub async fn save(&self, snapshot: &PersistedExecution, new_events: &[TimelineEvent]) -> Result<()> {
        let state_path = self.layout.state_file(&snapshot.repo_root, &snapshot.id);
        let json = to_vec_pretty(snapshot)?;
        write_atomic(&state_path, &json).await?;
        self.append_timeline(&snapshot.repo_root, &snapshot.id, new_events)
            .await
    }

    /// Load a snapshot; `None` when the execution was never persisted.
    ///
    /// # Errors
    /// Returns an error for unreadable or unparsable state other than "not found".
    pub async fn load(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
    ) -> Result<Option<PersistedExecution>> {
        let path = self.layout.state_file(repo_root, execution_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        Ok(Some(from_str(&contents)?))
    }

    /// Append events to `timeline.jsonl`, one JSON object per line.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or written.
    pub async fn append_timeline(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        events: &[TimelineEvent],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buffer, event)?;
            buffer.push(b'\n');
        }

        let path = self.layout.timeline_file(repo_root, execution_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the whole timeline. A missing file is an empty timeline; malformed lines are skipped.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub async fn load_timeline(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
    ) -> Result<Vec<TimelineEvent>> {
        let path = self.layout.timeline_file(repo_root, execution_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut events = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match from_str::<TimelineEvent>(line) {
                Ok(event) => events.push(event),
                Err(error) => tracing::warn!(
                    "Skipping malformed timeline line {} in {}: {error}",
                    line_no + 1,
                    path.display()
                ),
            }
        }
        Ok(events)
    }

    /// Ids of every execution directory that holds a snapshot, sorted.
    ///
    /// # Errors
    /// Returns an error if the exec directory exists but cannot be listed.
    pub async fn list_executions(&self, repo_root: &Path) -> Result<Vec<ExecutionId>> {
        let exec_root = self.layout.exec_root(repo_root);
        let mut entries = match fs::read_dir(&exec_root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if fs::try_exists(entry.path().join(STATE_FILE)).await? {
                ids.push(ExecutionId::from(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Whether `state.json` exists for the execution.
    ///
    /// # Errors
    /// Returns an error when existence cannot be determined, e.g. a permission failure.
    pub async fn exists(&self, repo_root: &Path, execution_id: &ExecutionId) -> Result<bool> {
        Ok(fs::try_exists(self.layout.state_file(repo_root, execution_id)).await?)
    }

    /// Remove the execution directory, staging included. Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be removed.
    pub async fn delete(&self, repo_root: &Path, execution_id: &ExecutionId) -> Result<bool> {
        remove_dir_if_exists(&self.layout.execution_dir(repo_root, execution_id)).await
    }
}
