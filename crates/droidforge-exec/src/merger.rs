//! Folding staged outputs back into the repository.

use crate::fs_util::{resolve_inside, write_atomic};
use crate::persistence::ExecutionPersistence;
use crate::staging::StagingArea;
use droidforge_core::{ExecutionId, NodeId, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::fs;

/// Outcome of a merge. Conflicts are data, not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    /// Paths written by more than one node with differing content
    pub conflicts: Vec<String>,
    /// Paths written into the repository (empty on conflict)
    pub merged_files: Vec<String>,
}

/// One node's version of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub node_id: NodeId,
    pub content: String,
    pub content_hash: String,
}

impl FileChange {
    pub fn new(node_id: NodeId, content: String) -> Self {
        let content_hash = hash_content(&content);
        Self {
            node_id,
            content,
            content_hash,
        }
    }
}

/// Every contributed version, keyed by repo-relative path
pub type ChangeSet = BTreeMap<String, Vec<FileChange>>;

fn hash_content(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Applies staged outputs of completed nodes, all or nothing
#[derive(Debug, Clone, Default)]
pub struct ExecutionMerger {
    persistence: ExecutionPersistence,
}

impl ExecutionMerger {
    pub fn new(persistence: ExecutionPersistence) -> Self {
        Self { persistence }
    }

    /// Collect the staged outputs of `completed_nodes` and write them into `repo_root`.
    ///
    /// Claims are read from the persisted snapshot. Nodes without a staging
    /// directory contribute nothing. If any path conflicts, nothing is written.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be read, a claim is invalid, a
    /// staged path escapes the repository, or a write fails.
    pub async fn merge(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        completed_nodes: &[NodeId],
        staging: &dyn StagingArea,
    ) -> Result<MergeResult> {
        let snapshot = self.persistence.load(repo_root, execution_id).await?;
        let claimed: Vec<(NodeId, Vec<String>)> = completed_nodes
            .iter()
            .map(|node_id| {
                let claims = snapshot
                    .as_ref()
                    .map(|state| state.claims_of(node_id))
                    .unwrap_or_default();
                (node_id.clone(), claims)
            })
            .collect();
        self.merge_claims(repo_root, execution_id, &claimed, staging)
            .await
    }

    /// Like [`ExecutionMerger::merge`], with the claims supplied by the caller.
    ///
    /// # Errors
    /// Returns an error if a claim is invalid, a staged path escapes the
    /// repository, or a write fails.
    pub async fn merge_claims(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        completed: &[(NodeId, Vec<String>)],
        staging: &dyn StagingArea,
    ) -> Result<MergeResult> {
        let mut changes = ChangeSet::new();

        for (node_id, claims) in completed {
            let staging_path = staging.staging_path(repo_root, execution_id, node_id);
            if !fs::try_exists(&staging_path).await? {
                tracing::debug!("No staging directory for {node_id}, skipping");
                continue;
            }

            let collected = staging
                .collect_changes(repo_root, &staging_path, claims)
                .await?;

            for (path, content) in collected {
                changes
                    .entry(path)
                    .or_default()
                    .push(FileChange::new(node_id.clone(), content));
            }
        }

        let conflicts = Self::detect_conflicts(&changes);
        if !conflicts.is_empty() {
            tracing::warn!(
                "Merge of {execution_id} blocked by {} conflicting files: {conflicts:?}",
                conflicts.len()
            );
            return Ok(MergeResult {
                success: false,
                conflicts,
                merged_files: Vec::new(),
            });
        }

        let mut targets = Vec::with_capacity(changes.len());
        for (path, versions) in &changes {
            let target = resolve_inside(repo_root, Path::new(path))?;
            if let Some(first) = versions.first() {
                targets.push((path, target, first));
            }
        }

        let mut merged_files = Vec::with_capacity(targets.len());
        for (path, target, change) in targets {
            write_atomic(&target, change.content.as_bytes()).await?;
            merged_files.push(path.clone());
        }

        tracing::info!(
            "Merged {} files for {execution_id}",
            merged_files.len()
        );
        Ok(MergeResult {
            success: true,
            conflicts: Vec::new(),
            merged_files,
        })
    }

    /// Paths contributed by more than one node with more than one distinct content hash.
    pub fn detect_conflicts(changes: &ChangeSet) -> Vec<String> {
        changes
            .iter()
            .filter(|(_, versions)| {
                versions.len() > 1
                    && versions
                        .iter()
                        .map(|change| change.content_hash.as_str())
                        .collect::<BTreeSet<_>>()
                        .len()
                        > 1
            })
            .map(|(path, _)| path.clone())
            .collect()
    }
}
