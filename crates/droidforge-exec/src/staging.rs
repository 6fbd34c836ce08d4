//! Per-node staging copies of the repository.
//!
//! Each dispatched node may work in its own deep copy under
//! `<repo>/.droidforge/exec/<execution>/staging/<node>`. Outputs are harvested
//! by resolving the node's claims as globs against that copy.

use crate::fs_util::{remove_dir_if_empty, remove_dir_if_exists};
use crate::layout::ExecLayout;
use async_trait::async_trait;
use droidforge_core::{ExecutionId, NodeId, Result};
use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::result::Result as StdResult;
use tokio::fs;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Harvested outputs: repo-relative path (forward slashes) to file content
pub type CollectedChanges = BTreeMap<String, String>;

const CLAIM_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// Isolated workspaces for nodes of an execution
#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Where the node's staging copy lives (whether or not it exists yet)
    fn staging_path(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> PathBuf;

    /// Deep-copy the repository into the node's staging directory.
    ///
    /// # Errors
    /// Returns an error if the repository cannot be read or the copy cannot be written.
    async fn create_staging(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<PathBuf>;

    /// Read every file under `staging_path` matched by one of `claims`.
    ///
    /// # Errors
    /// Returns an error if a claim is not a valid glob or the directory walk cannot run.
    async fn collect_changes(
        &self,
        repo_root: &Path,
        staging_path: &Path,
        claims: &[String],
    ) -> Result<CollectedChanges>;

    /// Remove the node's staging directory, and the `staging/` parent once empty.
    ///
    /// # Errors
    /// Returns an error if an existing directory cannot be removed.
    async fn clean_staging(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<()>;

    /// Remove every staging directory of an execution.
    ///
    /// # Errors
    /// Returns an error if an existing directory cannot be removed.
    async fn discard_execution(&self, repo_root: &Path, execution_id: &ExecutionId) -> Result<()>;
}

/// Filesystem-backed staging
#[derive(Debug, Clone, Default)]
pub struct StagingManager {
    layout: ExecLayout,
}

impl StagingManager {
    pub fn new(layout: ExecLayout) -> Self {
        Self { layout }
    }

    fn copy_dir_recursive(
        source: PathBuf,
        dest: PathBuf,
        repo_root: PathBuf,
        state_dir: String,
    ) -> BoxFuture<Result<usize>> {
        Box::pin(async move {
            fs::create_dir_all(&dest).await?;
            let mut entries = fs::read_dir(&source).await?;
            let mut copied = 0;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_name = entry.file_name();

                if source == repo_root {
                    let name = file_name.to_string_lossy();
                    if name == state_dir.as_str() || name == ".git" {
                        continue;
                    }
                }

                let dest_path = dest.join(&file_name);
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    copied += Self::copy_dir_recursive(
                        path,
                        dest_path,
                        repo_root.clone(),
                        state_dir.clone(),
                    )
                    .await?;
                } else if file_type.is_file() {
                    fs::copy(&path, &dest_path).await?;
                    copied += 1;
                } else if file_type.is_symlink() {
                    match fs::metadata(&path).await {
                        Ok(target) if target.is_file() => {
                            fs::copy(&path, &dest_path).await?;
                            copied += 1;
                        }
                        _ => tracing::debug!("Skipping symlink {} during staging", path.display()),
                    }
                }
            }

            Ok(copied)
        })
    }

    fn collect_blocking(staging_path: &Path, patterns: &[Pattern]) -> CollectedChanges {
        let mut changes = CollectedChanges::new();

        for entry in WalkDir::new(staging_path)
            .follow_links(false)
            .into_iter()
            .filter_map(StdResult::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(staging_path) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if !patterns
                .iter()
                .any(|pattern| pattern.matches_with(&relative, CLAIM_MATCH_OPTIONS))
            {
                continue;
            }

            match std::fs::read_to_string(entry.path()) {
                Ok(content) => {
                    changes.insert(relative, content);
                }
                Err(error) => {
                    tracing::warn!("Failed to read staged file {}: {error}", entry.path().display());
                }
            }
        }

        changes
    }
}

#[async_trait]
impl StagingArea for StagingManager {
    fn staging_path(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> PathBuf {
        self.layout.staging_path(repo_root, execution_id, node_id)
    }

    async fn create_staging(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<PathBuf> {
        let staging_path = self.staging_path(repo_root, execution_id, node_id);
        let copied = Self::copy_dir_recursive(
            repo_root.to_path_buf(),
            staging_path.clone(),
            repo_root.to_path_buf(),
            self.layout.state_dir_name().to_owned(),
        )
        .await?;

        tracing::debug!(
            "Staged {copied} files for {execution_id}/{node_id} at {}",
            staging_path.display()
        );
        Ok(staging_path)
    }

    async fn collect_changes(
        &self,
        _repo_root: &Path,
        staging_path: &Path,
        claims: &[String],
    ) -> Result<CollectedChanges> {
        if claims.is_empty() {
            return Ok(CollectedChanges::new());
        }

        let patterns = claims
            .iter()
            .map(|claim| Pattern::new(claim.as_str()))
            .collect::<StdResult<Vec<_>, _>>()?;
        let root = staging_path.to_path_buf();

        let changes = spawn_blocking(move || Self::collect_blocking(&root, &patterns)).await?;
        tracing::debug!(
            "Collected {} files from {}",
            changes.len(),
            staging_path.display()
        );
        Ok(changes)
    }

    async fn clean_staging(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<()> {
        remove_dir_if_exists(&self.staging_path(repo_root, execution_id, node_id)).await?;
        remove_dir_if_empty(&self.layout.staging_root(repo_root, execution_id)).await?;
        Ok(())
    }

    async fn discard_execution(&self, repo_root: &Path, execution_id: &ExecutionId) -> Result<()> {
        if remove_dir_if_exists(&self.layout.staging_root(repo_root, execution_id)).await? {
            tracing::debug!("Discarded staging for {execution_id}");
        }
        Ok(())
    }
}
