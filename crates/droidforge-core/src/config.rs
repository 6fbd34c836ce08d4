//! Configuration types for scheduling, persistence, health checks and activity logging.

use crate::error::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the activity log directory.
pub const LOG_DIR_ENV: &str = "DROIDFORGE_LOG_DIR";

/// File name of the engine config inside a repository's state directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Complete engine configuration.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduling configuration
    pub execution: ExecutionConfig,
    /// On-disk state configuration
    pub persistence: PersistenceConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Activity log configuration
    pub logging: LoggingConfig,
}

/// Scheduling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Concurrency cap used when a plan does not set one
    pub default_concurrency: usize,
    /// Provision a staging copy for each node when it is dispatched
    pub stage_on_dispatch: bool,
    /// Run the liveness detector when a poll dispatches nothing
    pub detect_deadlocks: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 2,
            stage_on_dispatch: true,
            detect_deadlocks: true,
        }
    }
}

impl ExecutionConfig {
    /// Concurrency cap for a plan: the plan's own value or the default, never below one.
    pub fn effective_concurrency(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_concurrency).max(1)
    }
}

/// On-disk state configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Write `state.json`/`timeline.jsonl` on every mutation
    pub enabled: bool,
    /// Name of the state directory at the repository root
    pub state_dir_name: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir_name: ".droidforge".to_owned(),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds without activity before a running execution counts as stalled
    pub stalled_threshold_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stalled_threshold_secs: 300,
        }
    }
}

/// Activity log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Whether tool calls are recorded in the activity log
    pub enabled: bool,
    /// Directory for `<repo-slug>.events.jsonl` files
    pub activity_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activity_log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Resolve the activity log directory.
    ///
    /// Precedence: `DROIDFORGE_LOG_DIR`, then the configured directory, then
    /// `~/.factory/droidforge/logs`.
    pub fn resolve_log_dir(&self) -> PathBuf {
        if let Ok(dir) = env::var(LOG_DIR_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.activity_log_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".factory")
            .join("droidforge")
            .join("logs")
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections and keys keep their defaults.
    ///
    /// # Errors
    /// Returns `Config` if the document is not valid TOML for this schema.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|error| ExecError::Config(format!("invalid engine config: {error}")))
    }

    /// Location of a repository's engine config: `<repo>/.droidforge/config.toml`.
    pub fn repo_config_path(repo_root: &Path) -> PathBuf {
        repo_root
            .join(PersistenceConfig::default().state_dir_name)
            .join(CONFIG_FILE)
    }

    /// Configuration for the engine working on `repo_root`.
    ///
    /// Reads the repository's config file when there is one and falls back
    /// to the defaults when there is not. Nothing is written.
    ///
    /// # Errors
    /// Returns `Config` for a malformed file, or an I/O error other than "not found".
    pub fn for_repo(repo_root: &Path) -> Result<Self> {
        let path = Self::repo_config_path(repo_root);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::debug!("No engine config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(error) => return Err(error.into()),
        };

        let config = Self::from_toml(&contents)?;
        tracing::debug!(
            "Loaded engine config from {}: default_concurrency={}, persistence={}",
            path.display(),
            config.execution.default_concurrency,
            config.persistence.enabled
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.execution.default_concurrency, 2);
        assert!(config.execution.stage_on_dispatch);
        assert!(config.persistence.enabled);
        assert_eq!(config.persistence.state_dir_name, ".droidforge");
        assert_eq!(config.health.stalled_threshold_secs, 300);
    }

    #[test]
    fn test_effective_concurrency() {
        let config = ExecutionConfig::default();
        assert_eq!(config.effective_concurrency(None), 2);
        assert_eq!(config.effective_concurrency(Some(5)), 5);
        assert_eq!(config.effective_concurrency(Some(0)), 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_content = r"
[execution]
default_concurrency = 4
";
        let config = match EngineConfig::from_toml(toml_content) {
            Ok(config) => config,
            Err(error) => panic!("parse failed: {error}"),
        };
        assert_eq!(config.execution.default_concurrency, 4);
        assert!(config.execution.detect_deadlocks);
        assert_eq!(config.persistence.state_dir_name, ".droidforge");
    }

    #[test]
    fn test_for_repo_reads_state_dir_config() {
        let repo = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let path = EngineConfig::repo_config_path(repo.path());
        assert_eq!(path, repo.path().join(".droidforge").join("config.toml"));

        let defaults = match EngineConfig::for_repo(repo.path()) {
            Ok(config) => config,
            Err(error) => panic!("load defaults failed: {error}"),
        };
        assert_eq!(defaults, EngineConfig::default());
        assert!(!path.exists());

        let contents = "[execution]\ndefault_concurrency = 3\nstage_on_dispatch = false\n\n[logging]\nenabled = false\n";
        if let Err(error) = fs::create_dir_all(repo.path().join(".droidforge")) {
            panic!("create state dir: {error}");
        }
        if let Err(error) = fs::write(&path, contents) {
            panic!("write config: {error}");
        }
        let loaded = match EngineConfig::for_repo(repo.path()) {
            Ok(config) => config,
            Err(error) => panic!("load failed: {error}"),
        };
        assert_eq!(loaded.execution.default_concurrency, 3);
        assert!(!loaded.execution.stage_on_dispatch);
        assert!(!loaded.logging.enabled);
        assert!(loaded.persistence.enabled);
    }

    #[test]
    fn test_malformed_repo_config_is_config_error() {
        let result = EngineConfig::from_toml("[execution]\ndefault_concurrency = \"many\"\n");
        assert!(matches!(result, Err(ExecError::Config(_))));
    }
}
