//! Tool-facing wrappers around the execution manager.
//!
//! Every call is recorded in a per-repository activity log. The log is
//! best-effort: a failed write is traced and never fails the call.

use crate::manager::ExecutionManager;
use crate::merger::MergeResult;
use crate::record::{ExecutionSnapshot, NodeSchedule};
use chrono::{DateTime, Utc};
use droidforge_core::{
    ExecError, ExecutionId, ExecutionPlan, ExecutionStatus, LoggingConfig, NodeId, Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, from_value, json, to_string, to_value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt as _;

/// Outcome of a tool call as written to the activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Ok,
    Error,
}

/// One line of `<repo-slug>.events.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Append-only JSONL log of tool calls, one file per repository
#[derive(Debug, Clone)]
pub struct ActivityLog {
    dir: Option<PathBuf>,
}

impl ActivityLog {
    /// A log writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        if config.enabled {
            Self::new(config.resolve_log_dir())
        } else {
            Self::disabled()
        }
    }

    /// File the records of `repo_root` go to, if logging is enabled.
    pub fn file_for(&self, repo_root: &Path) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.events.jsonl", repo_slug(repo_root))))
    }

    /// Append one record. Failures are logged and swallowed.
    pub async fn append(&self, repo_root: &Path, record: &LogRecord) {
        let Some(path) = self.file_for(repo_root) else {
            return;
        };
        if let Err(error) = Self::write_line(&path, record).await {
            tracing::warn!(
                "Failed to write activity log {}: {error}",
                path.display()
            );
        }
    }

    async fn write_line(path: &Path, record: &LogRecord) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Last `limit` lines of the repository's log, oldest first.
    ///
    /// # Errors
    /// Returns an error if the log exists but cannot be read.
    pub async fn read_tail(&self, repo_root: &Path, limit: usize) -> Result<Vec<String>> {
        let Some(path) = self.file_for(repo_root) else {
            return Ok(Vec::new());
        };
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let lines: Vec<String> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

/// Lowercased repository path with every run of non-alphanumerics collapsed to `-`.
pub fn repo_slug(repo_root: &Path) -> String {
    let raw = repo_root.to_string_lossy().to_lowercase();
    let mut slug = String::with_capacity(raw.len());
    for character in raw.chars() {
        if character.is_ascii_alphanumeric() {
            slug.push(character);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "root".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecutionInput {
    pub repo_root: PathBuf,
    pub plan: ExecutionPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

/// Input of every tool that addresses a single execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRef {
    pub repo_root: PathBuf,
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskInput {
    pub repo_root: PathBuf,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub outcome: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsInput {
    pub repo_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOutput {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
}

/// `task` is `null` when nothing can be dispatched right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTaskOutput {
    pub execution_id: ExecutionId,
    pub task: Option<NodeSchedule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutput {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(flatten)]
    pub result: MergeResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionListing {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub request_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsOutput {
    pub executions: Vec<ExecutionListing>,
}

/// Names accepted by [`ExecutionTools::call`]
pub const TOOL_NAMES: &[&str] = &[
    "plan_execution",
    "start_execution",
    "next_execution_task",
    "complete_execution_task",
    "poll_execution",
    "pause_execution",
    "resume_execution",
    "abort_execution",
    "merge_execution",
    "list_executions",
];

/// The execution tools exposed to droids
#[derive(Debug, Clone)]
pub struct ExecutionTools {
    manager: Arc<ExecutionManager>,
    log: ActivityLog,
}

impl ExecutionTools {
    /// Wrap `manager`, logging according to its configuration.
    pub fn new(manager: Arc<ExecutionManager>) -> Self {
        let log = ActivityLog::from_config(&manager.config().logging);
        Self { manager, log }
    }

    #[must_use]
    pub fn with_log(mut self, log: ActivityLog) -> Self {
        self.log = log;
        self
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    pub fn activity_log(&self) -> &ActivityLog {
        &self.log
    }

    async fn record<T: Send>(
        &self,
        repo_root: &Path,
        event: &str,
        started: Instant,
        payload: Value,
        result: Result<T>,
    ) -> Result<T> {
        let status = if result.is_ok() {
            LogStatus::Ok
        } else {
            LogStatus::Error
        };
        self.record_as(repo_root, event, started, payload, status, result)
            .await
    }

    /// Log the outcome of a call under `status` and pass the result through.
    async fn record_as<T: Send>(
        &self,
        repo_root: &Path,
        event: &str,
        started: Instant,
        mut payload: Value,
        status: LogStatus,
        result: Result<T>,
    ) -> Result<T> {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Value::Object(map) = &mut payload {
            map.insert("durationMs".to_owned(), json!(elapsed_ms));
            if let Err(error) = &result {
                map.insert("message".to_owned(), Value::String(error.to_string()));
            }
        }

        self.log
            .append(
                repo_root,
                &LogRecord {
                    timestamp: Utc::now(),
                    event: event.to_owned(),
                    status,
                    payload: Some(payload),
                },
            )
            .await;
        result
    }

    /// Load the referenced execution from its repository if it is not cached.
    async fn open(&self, input: &ExecutionRef) -> Result<()> {
        self.manager
            .open(&input.repo_root, &input.execution_id)
            .await
    }

    /// # Errors
    /// Returns the manager's error for an invalid plan or a failed write.
    pub async fn plan_execution(&self, input: PlanExecutionInput) -> Result<StatusOutput> {
        let started = Instant::now();
        let result = self
            .manager
            .plan(&input.repo_root, &input.plan, input.execution_id)
            .await
            .map(|snapshot| StatusOutput {
                execution_id: snapshot.execution_id,
                status: snapshot.status,
            });
        let payload = match &result {
            Ok(output) => json!({ "executionId": output.execution_id, "nodes": input.plan.nodes.len() }),
            Err(_) => json!({ "nodes": input.plan.nodes.len() }),
        };
        self.record(&input.repo_root, "plan_execution", started, payload, result)
            .await
    }

    /// # Errors
    /// Returns the manager's error.
    pub async fn start_execution(&self, input: ExecutionRef) -> Result<StatusOutput> {
        let started = Instant::now();
        let result = match self.open(&input).await {
            Ok(()) => self.manager.start(&input.execution_id).await.map(status_of),
            Err(error) => Err(error),
        };
        let payload = json!({ "executionId": input.execution_id });
        self.record(&input.repo_root, "start_execution", started, payload, result)
            .await
    }

    /// # Errors
    /// Returns the manager's error.
    pub async fn next_execution_task(&self, input: ExecutionRef) -> Result<NextTaskOutput> {
        let started = Instant::now();
        let result = match self.open(&input).await {
            Ok(()) => self.manager.request_next(&input.execution_id).await,
            Err(error) => Err(error),
        };
        let payload = match &result {
            Ok(Some(task)) => json!({
                "executionId": input.execution_id,
                "nodeId": task.node_id,
                "droidId": task.droid_id,
            }),
            Ok(None) | Err(_) => json!({ "executionId": input.execution_id, "nodeId": null }),
        };
        let task = self
            .record(&input.repo_root, "next_execution_task", started, payload, result)
            .await?;
        Ok(NextTaskOutput {
            execution_id: input.execution_id,
            task,
        })
    }

    /// Report a dispatched node. A `failed` outcome is logged as an error.
    ///
    /// # Errors
    /// Returns the manager's error, e.g. when the node is not running.
    pub async fn complete_execution_task(&self, input: CompleteTaskInput) -> Result<StatusOutput> {
        let started = Instant::now();
        let opened = self
            .manager
            .open(&input.repo_root, &input.execution_id)
            .await;
        let result = match (opened, input.outcome) {
            (Err(error), _) => Err(error),
            (Ok(()), TaskOutcome::Completed) => {
                self.manager
                    .complete_node(&input.execution_id, &input.node_id, input.detail)
                    .await
            }
            (Ok(()), TaskOutcome::Failed) => {
                self.manager
                    .fail_node(&input.execution_id, &input.node_id, input.detail)
                    .await
            }
        }
        .map(status_of);
        let payload = json!({
            "executionId": input.execution_id,
            "nodeId": input.node_id,
            "outcome": input.outcome,
        });

        let status = if result.is_ok() && input.outcome == TaskOutcome::Completed {
            LogStatus::Ok
        } else {
            LogStatus::Error
        };
        self.record_as(
            &input.repo_root,
            "complete_execution_task",
            started,
            payload,
            status,
            result,
        )
        .await
    }

    /// # Errors
    /// Returns `UnknownExecution` when the execution is neither cached nor on disk.
    pub async fn poll_execution(&self, input: ExecutionRef) -> Result<ExecutionSnapshot> {
        let started = Instant::now();
        let result = match self.open(&input).await {
            Ok(()) => self.manager.poll(&input.execution_id).await,
            Err(error) => Err(error),
        };
        let payload = match &result {
            Ok(snapshot) => json!({ "executionId": input.execution_id, "status": snapshot.status }),
            Err(_) => json!({ "executionId": input.execution_id }),
        };
        self.record(&input.repo_root, "poll_execution", started, payload, result)
            .await
    }

    /// # Errors
    /// Returns the manager's error.
    pub async fn pause_execution(&self, input: ExecutionRef) -> Result<StatusOutput> {
        let started = Instant::now();
        let result = match self.open(&input).await {
            Ok(()) => self.manager.pause(&input.execution_id).await.map(status_of),
            Err(error) => Err(error),
        };
        let payload = json!({ "executionId": input.execution_id });
        self.record(&input.repo_root, "pause_execution", started, payload, result)
            .await
    }

    /// # Errors
    /// Returns the manager's error.
    pub async fn resume_execution(&self, input: ExecutionRef) -> Result<StatusOutput> {
        let started = Instant::now();
        let result = match self.open(&input).await {
            Ok(()) => self.manager.resume(&input.execution_id).await.map(status_of),
            Err(error) => Err(error),
        };
        let payload = json!({ "executionId": input.execution_id });
        self.record(&input.repo_root, "resume_execution", started, payload, result)
            .await
    }

    /// # Errors
    /// Returns the manager's error.
    pub async fn abort_execution(&self, input: ExecutionRef) -> Result<StatusOutput> {
        let started = Instant::now();
        let result = match self.open(&input).await {
            Ok(()) => self.manager.abort(&input.execution_id).await.map(status_of),
            Err(error) => Err(error),
        };
        let payload = json!({ "executionId": input.execution_id });
        self.record(&input.repo_root, "abort_execution", started, payload, result)
            .await
    }

    /// Merge staged outputs. Conflicts are reported in the output, not as an error.
    ///
    /// # Errors
    /// Returns the manager's error.
    pub async fn merge_execution(&self, input: ExecutionRef) -> Result<MergeOutput> {
        let started = Instant::now();
        let outcome = match self.open(&input).await {
            Ok(()) => self.manager.merge(&input.execution_id).await,
            Err(error) => Err(error),
        };
        let result = match outcome {
            Ok(merged) => self
                .manager
                .poll(&input.execution_id)
                .await
                .map(|snapshot| MergeOutput {
                    execution_id: snapshot.execution_id,
                    status: snapshot.status,
                    result: merged,
                }),
            Err(error) => Err(error),
        };
        let payload = match &result {
            Ok(output) => json!({
                "executionId": input.execution_id,
                "success": output.result.success,
                "conflicts": output.result.conflicts.len(),
                "mergedFiles": output.result.merged_files.len(),
            }),
            Err(_) => json!({ "executionId": input.execution_id }),
        };
        self.record(&input.repo_root, "merge_execution", started, payload, result)
            .await
    }

    /// Executions of one repository, newest first, including ones only on disk.
    ///
    /// # Errors
    /// Returns an error if the execution directory cannot be listed.
    pub async fn list_executions(&self, input: ListExecutionsInput) -> Result<ListExecutionsOutput> {
        let started = Instant::now();
        let result = self.collect_listings(&input.repo_root).await;
        let payload = match &result {
            Ok(output) => json!({ "count": output.executions.len() }),
            Err(_) => json!({}),
        };
        self.record(&input.repo_root, "list_executions", started, payload, result)
            .await
    }

    async fn collect_listings(&self, repo_root: &Path) -> Result<ListExecutionsOutput> {
        if self.manager.config().persistence.enabled {
            for id in self.manager.persistence().list_executions(repo_root).await? {
                if self.manager.is_cached(&id).await {
                    continue;
                }
                if let Err(error) = self.manager.recover(repo_root, &id).await {
                    tracing::warn!("Skipping unreadable execution {id}: {error}");
                }
            }
        }

        let executions = self
            .manager
            .list()
            .await
            .into_iter()
            .filter(|snapshot| snapshot.repo_root == repo_root)
            .map(|snapshot| ExecutionListing {
                execution_id: snapshot.execution_id,
                status: snapshot.status,
                created_at: snapshot.created_at,
                last_updated: snapshot.last_updated,
                request_count: snapshot.requests.len(),
            })
            .collect();
        Ok(ListExecutionsOutput { executions })
    }

    /// Dispatch a call by tool name with JSON parameters.
    ///
    /// # Errors
    /// Returns `UnknownTool` for an unrecognised name, `Json` for parameters
    /// that do not match the tool's input, or the tool's own error.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value> {
        match name {
            "plan_execution" => to_json(&self.plan_execution(parse(params)?).await?),
            "start_execution" => to_json(&self.start_execution(parse(params)?).await?),
            "next_execution_task" => to_json(&self.next_execution_task(parse(params)?).await?),
            "complete_execution_task" => {
                to_json(&self.complete_execution_task(parse(params)?).await?)
            }
            "poll_execution" => to_json(&self.poll_execution(parse(params)?).await?),
            "pause_execution" => to_json(&self.pause_execution(parse(params)?).await?),
            "resume_execution" => to_json(&self.resume_execution(parse(params)?).await?),
            "abort_execution" => to_json(&self.abort_execution(parse(params)?).await?),
            "merge_execution" => to_json(&self.merge_execution(parse(params)?).await?),
            "list_executions" => to_json(&self.list_executions(parse(params)?).await?),
            other => Err(ExecError::UnknownTool(other.to_owned())),
        }
    }
}

fn status_of(snapshot: ExecutionSnapshot) -> StatusOutput {
    StatusOutput {
        execution_id: snapshot.execution_id,
        status: snapshot.status,
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    Ok(from_value(params)?)
}

fn to_json<T: Serialize>(output: &T) -> Result<Value> {
    Ok(to_value(output)?)
}
