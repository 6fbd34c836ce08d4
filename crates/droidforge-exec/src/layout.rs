//! On-disk layout of `<repo>/<state-dir>/exec/<execution>/...`.

use droidforge_core::{ExecutionId, NodeId};
use std::path::{Path, PathBuf};

/// Name of the snapshot file in an execution directory.
pub const STATE_FILE: &str = "state.json";
/// Name of the append-only timeline in an execution directory.
pub const TIMELINE_FILE: &str = "timeline.jsonl";
/// Name of the staging directory in an execution directory.
pub const STAGING_DIR: &str = "staging";

/// Resolves every path the engine writes under a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecLayout {
    state_dir_name: String,
}

impl Default for ExecLayout {
    fn default() -> Self {
        Self::new(".droidforge")
    }
}

impl ExecLayout {
    /// Creates a layout rooted at `<repo>/<state_dir_name>`.
    pub fn new(state_dir_name: impl Into<String>) -> Self {
        Self {
            state_dir_name: state_dir_name.into(),
        }
    }

    /// Name of the state directory, which staging never copies.
    pub fn state_dir_name(&self) -> &str {
        &self.state_dir_name
    }

    pub fn exec_root(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.state_dir_name).join("exec")
    }

    pub fn execution_dir(&self, repo_root: &Path, execution_id: &ExecutionId) -> PathBuf {
        self.exec_root(repo_root).join(execution_id.as_str())
    }

    pub fn state_file(&self, repo_root: &Path, execution_id: &ExecutionId) -> PathBuf {
        self.execution_dir(repo_root, execution_id).join(STATE_FILE)
    }

    pub fn timeline_file(&self, repo_root: &Path, execution_id: &ExecutionId) -> PathBuf {
        self.execution_dir(repo_root, execution_id)
            .join(TIMELINE_FILE)
    }

    pub fn staging_root(&self, repo_root: &Path, execution_id: &ExecutionId) -> PathBuf {
        self.execution_dir(repo_root, execution_id)
            .join(STAGING_DIR)
    }

    pub fn staging_path(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> PathBuf {
        self.staging_root(repo_root, execution_id)
            .join(node_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ExecLayout::default();
        let repo = Path::new("/repo");
        let exec = ExecutionId::from("exec-1");

        assert_eq!(
            layout.state_file(repo, &exec),
            PathBuf::from("/repo/.droidforge/exec/exec-1/state.json")
        );
        assert_eq!(
            layout.timeline_file(repo, &exec),
            PathBuf::from("/repo/.droidforge/exec/exec-1/timeline.jsonl")
        );
        assert_eq!(
            layout.staging_path(repo, &exec, &NodeId::from("build")),
            PathBuf::from("/repo/.droidforge/exec/exec-1/staging/build")
        );
    }
}
