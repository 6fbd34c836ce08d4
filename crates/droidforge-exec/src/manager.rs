//! The execution orchestrator.
//!
//! `ExecutionManager` owns every execution record, drives the status machine,
//! arbitrates resource claims through the per-execution lock table, and writes
//! through to disk on every mutation. It never runs task logic: callers poll
//! for work with [`ExecutionManager::request_next`] and report outcomes back.
//!
//! Memory is a cache of `.droidforge/exec/`: an id missing from the registry is
//! rebuilt from disk before it is planned, enqueued or opened, and a mutation
//! whose write fails is rolled back so both sides keep agreeing.

use crate::claims::ResourceMatcher;
use crate::deadlock::{DeadlockDetector, DeadlockReport};
use crate::events::ExecutionEventBus;
use crate::graph::DependencyGraph;
use crate::health::{HealthChecker, HealthStatus};
use crate::layout::ExecLayout;
use crate::merger::{ExecutionMerger, MergeResult};
use crate::metrics::MetricsCollector;
use crate::persistence::ExecutionPersistence;
use crate::record::{EnqueueRequest, ExecutionRecord, ExecutionSnapshot, NodeSchedule};
use crate::staging::{StagingArea, StagingManager};
use chrono::Utc;
use droidforge_core::{
    AdHocRequest, EngineConfig, EventKind, ExecError, ExecutionId, ExecutionPlan, ExecutionStatus,
    NodeId, NodeStatus, Result,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Longest request excerpt stored in a `request.received` event.
const REQUEST_SNIPPET_CHARS: usize = 120;

type RecordHandle = Arc<Mutex<ExecutionRecord>>;

/// Coordinates plans, dispatch, locks, staging, merge and persistence.
pub struct ExecutionManager {
    config: EngineConfig,
    executions: RwLock<HashMap<ExecutionId, RecordHandle>>,
    persistence: ExecutionPersistence,
    staging: Arc<dyn StagingArea>,
    merger: ExecutionMerger,
    events: Arc<ExecutionEventBus>,
    metrics: MetricsCollector,
    health: HealthChecker,
    detector: DeadlockDetector,
    matcher: ResourceMatcher,
}

impl ExecutionManager {
    /// Creates a manager with filesystem staging.
    ///
    /// # Errors
    /// Returns `Config` if the health threshold is not positive.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let layout = ExecLayout::new(config.persistence.state_dir_name.clone());
        let staging: Arc<dyn StagingArea> = Arc::new(StagingManager::new(layout));
        Self::with_staging(config, staging)
    }

    /// Creates a manager configured by `<repo_root>/.droidforge/config.toml`, or the defaults.
    ///
    /// # Errors
    /// Returns `Config` for a malformed config file or a non-positive health
    /// threshold, or an error if the file cannot be read.
    pub fn for_repo(repo_root: &Path) -> Result<Self> {
        Self::new(EngineConfig::for_repo(repo_root)?)
    }

    /// Creates a manager with a caller-provided staging implementation.
    ///
    /// # Errors
    /// Returns `Config` if the health threshold is not positive.
    pub fn with_staging(config: EngineConfig, staging: Arc<dyn StagingArea>) -> Result<Self> {
        let layout = ExecLayout::new(config.persistence.state_dir_name.clone());
        let persistence = ExecutionPersistence::new(layout);
        let health = HealthChecker::new(config.health.stalled_threshold_secs)?;

        Ok(Self {
            merger: ExecutionMerger::new(persistence.clone()),
            persistence,
            staging,
            events: Arc::new(ExecutionEventBus::new()),
            metrics: MetricsCollector::new(),
            health,
            detector: DeadlockDetector,
            matcher: ResourceMatcher,
            executions: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Event bus every timeline entry is published on
    pub fn events(&self) -> &Arc<ExecutionEventBus> {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn persistence(&self) -> &ExecutionPersistence {
        &self.persistence
    }

    async fn handle(&self, execution_id: &ExecutionId) -> Result<RecordHandle> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(Arc::clone)
            .ok_or_else(|| ExecError::UnknownExecution(execution_id.clone()))
    }

    /// Register `record`, replacing any cached record under the same id.
    async fn insert(&self, record: ExecutionRecord) -> RecordHandle {
        let id = record.id.clone();
        let handle = Arc::new(Mutex::new(record));
        self.executions
            .write()
            .await
            .insert(id, Arc::clone(&handle));
        handle
    }

    /// Register `record` unless another caller got there first. The flag is true when `record` won.
    async fn insert_if_absent(&self, record: ExecutionRecord) -> (RecordHandle, bool) {
        match self.executions.write().await.entry(record.id.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => (Arc::clone(entry.insert(Arc::new(Mutex::new(record)))), true),
        }
    }

    /// Rebuild a record from `state.json` and `timeline.jsonl`.
    async fn load_record(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>> {
        let Some(persisted) = self.persistence.load(repo_root, execution_id).await? else {
            return Ok(None);
        };
        let timeline = self.persistence.load_timeline(repo_root, execution_id).await?;
        Ok(Some(ExecutionRecord::from_persisted(persisted, timeline)))
    }

    fn track_recovered(&self, record: &ExecutionRecord) {
        if matches!(record.status, ExecutionStatus::Running | ExecutionStatus::Paused) {
            let started_at = record
                .timeline
                .iter()
                .find(|event| event.event == EventKind::ExecutionStarted)
                .map_or(record.created_at, |event| event.timestamp);
            self.metrics
                .record_execution_recovered(&record.id, started_at, record.nodes.values());
        }
    }

    /// The cached record for `execution_id`, rebuilt from disk on a miss.
    async fn resolve(
        &self,
        repo_root: &Path,
        execution_id: &ExecutionId,
    ) -> Result<Option<RecordHandle>> {
        if let Some(handle) = self.executions.read().await.get(execution_id) {
            return Ok(Some(Arc::clone(handle)));
        }
        execution_id.ensure_path_safe()?;
        if !self.config.persistence.enabled {
            return Ok(None);
        }
        let Some(record) = self.load_record(repo_root, execution_id).await? else {
            return Ok(None);
        };

        let (handle, inserted) = self.insert_if_absent(record).await;
        if inserted {
            let loaded = handle.lock().await;
            self.track_recovered(&loaded);
            tracing::debug!("Loaded execution {execution_id} from disk");
        }
        Ok(Some(handle))
    }

    /// Make sure an execution is in memory, loading it from `repo_root` if needed.
    ///
    /// # Errors
    /// Returns `InvalidPlan` for an id that is not a plain directory name,
    /// `UnknownExecution` when it is neither cached nor persisted, or an error
    /// if the persisted state cannot be read.
    pub async fn open(&self, repo_root: &Path, execution_id: &ExecutionId) -> Result<()> {
        match self.resolve(repo_root, execution_id).await? {
            Some(_) => Ok(()),
            None => Err(ExecError::UnknownExecution(execution_id.clone())),
        }
    }

    /// Persist the record and publish every event appended since the last commit.
    async fn commit(&self, record: &mut ExecutionRecord) -> Result<()> {
        let pending = record.uncommitted_events().to_vec();
        if self.config.persistence.enabled {
            self.persistence.save(&record.to_persisted(), &pending).await?;
        }
        record.committed = record.timeline.len();

        for event in &pending {
            self.events.emit(event);
        }
        Ok(())
    }

    /// Commit, or put `checkpoint` back if the write fails.
    async fn commit_or_restore(
        &self,
        record: &mut ExecutionRecord,
        checkpoint: ExecutionRecord,
    ) -> Result<()> {
        if let Err(error) = self.commit(record).await {
            tracing::warn!("Persisting execution {} failed, rolled back: {error}", record.id);
            *record = checkpoint;
            return Err(error);
        }
        Ok(())
    }

    fn invalid_transition(record: &ExecutionRecord, action: &'static str) -> ExecError {
        ExecError::InvalidTransition {
            execution: record.id.clone(),
            status: record.status,
            action,
        }
    }

    /// Validate `plan` and install it under a new or existing execution id.
    ///
    /// An id that is only on disk is loaded first, so a persisted run is never overwritten.
    ///
    /// # Errors
    /// Returns `InvalidPlan` or `CyclicPlan` for a malformed plan or id,
    /// `InvalidTransition` when re-planning an execution that has started, or
    /// an I/O error if the snapshot cannot be written.
    pub async fn plan(
        &self,
        repo_root: &Path,
        plan: &ExecutionPlan,
        execution_id: Option<ExecutionId>,
    ) -> Result<ExecutionSnapshot> {
        plan.validate()?;
        let graph = DependencyGraph::from_plan(plan);
        if graph.has_cycles() {
            return Err(ExecError::CyclicPlan);
        }
        let concurrency = self
            .config
            .execution
            .effective_concurrency(plan.concurrency);

        let overlaps = self.matcher.plan_overlaps(plan, &graph);
        for overlap in &overlaps {
            tracing::warn!(
                "Claims {} of {} and {} of {} overlap; conflicts will surface at merge",
                overlap.first_claim,
                overlap.first,
                overlap.second_claim,
                overlap.second
            );
        }

        let existing = match &execution_id {
            Some(id) => self.resolve(repo_root, id).await?,
            None => None,
        };
        let (handle, fresh) = match existing {
            Some(handle) => (handle, false),
            None => {
                let id = execution_id.unwrap_or_else(ExecutionId::generate);
                self.insert_if_absent(ExecutionRecord::new(id, repo_root.to_path_buf(), concurrency))
                    .await
            }
        };

        let mut record = handle.lock().await;
        if record.status != ExecutionStatus::Planned {
            return Err(Self::invalid_transition(&record, "plan"));
        }

        let checkpoint = record.clone();
        record.install_plan(plan, graph, concurrency);
        record.push_event(
            EventKind::ExecutionPlanned,
            None,
            Some(json!({
                "nodes": plan.nodes.len(),
                "concurrency": concurrency,
                "claimOverlaps": overlaps,
            })),
        );
        if let Err(error) = self.commit_or_restore(&mut record, checkpoint).await {
            if fresh {
                let id = record.id.clone();
                drop(record);
                self.executions.write().await.remove(&id);
            }
            return Err(error);
        }

        tracing::info!(
            "Planned execution {} with {} nodes (concurrency {concurrency})",
            record.id,
            plan.nodes.len()
        );
        Ok(record.snapshot())
    }

    /// `planned → running`. Already running or terminal executions are returned unchanged.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, or `InvalidTransition` for a paused execution.
    pub async fn start(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.lock().await;

        match record.status {
            ExecutionStatus::Planned => {}
            ExecutionStatus::Paused => return Err(Self::invalid_transition(&record, "start")),
            _ => return Ok(record.snapshot()),
        }

        let checkpoint = record.clone();
        record.status = ExecutionStatus::Running;
        record.push_event(EventKind::ExecutionStarted, None, None);
        let completed = Self::check_completion(&mut record);
        self.commit_or_restore(&mut record, checkpoint).await?;

        self.metrics
            .record_execution_start(&record.id, record.nodes.len());
        if completed {
            self.metrics.record_execution_complete(&record.id);
        }
        tracing::info!("Started execution {}", record.id);
        Ok(record.snapshot())
    }

    /// Record an ad-hoc request against an existing or fresh execution.
    ///
    /// # Errors
    /// Returns `InvalidPlan` for an id that is not a plain directory name, or
    /// an I/O error if the snapshot cannot be read or written.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<ExecutionId> {
        let existing = match &request.execution_id {
            Some(id) => self.resolve(&request.repo_root, id).await?,
            None => None,
        };
        let (handle, fresh) = match existing {
            Some(handle) => (handle, false),
            None => {
                let id = request
                    .execution_id
                    .clone()
                    .unwrap_or_else(ExecutionId::generate);
                let concurrency = self.config.execution.effective_concurrency(None);
                self.insert_if_absent(ExecutionRecord::new(id, request.repo_root.clone(), concurrency))
                    .await
            }
        };

        let mut record = handle.lock().await;
        let checkpoint = record.clone();
        let snippet: String = request.request.chars().take(REQUEST_SNIPPET_CHARS).collect();
        record.requests.push(AdHocRequest {
            droid_id: request.droid_id.clone(),
            request: request.request,
            received_at: Utc::now(),
        });
        record.push_event(
            EventKind::RequestReceived,
            None,
            Some(json!({ "droidId": request.droid_id, "snippet": snippet })),
        );
        if let Err(error) = self.commit_or_restore(&mut record, checkpoint).await {
            if fresh {
                let id = record.id.clone();
                drop(record);
                self.executions.write().await.remove(&id);
            }
            return Err(error);
        }

        tracing::debug!("Recorded request for {} on {}", request.droid_id, record.id);
        Ok(record.id.clone())
    }

    /// Dispatch the first ready node whose claims can all be locked now.
    ///
    /// Returns `None` when the execution is not running, the running set is at
    /// the concurrency cap, or no ready node can take its locks.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, or an I/O error if staging or persistence fails.
    /// On error nothing is dispatched: the node stays ready and holds no locks.
    pub async fn request_next(&self, execution_id: &ExecutionId) -> Result<Option<NodeSchedule>> {
        let handle = self.handle(execution_id).await?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;

        if record.status != ExecutionStatus::Running || record.running.len() >= record.concurrency {
            return Ok(None);
        }

        let mut chosen = None;
        for (position, node_id) in record.ready_queue.iter().enumerate() {
            let Some(state) = record.nodes.get(node_id) else {
                continue;
            };
            let claims = state.spec.sorted_claims();
            if record.locks.try_acquire(&claims, state.spec.lock_mode(), node_id) {
                chosen = Some((position, state.spec.clone(), claims));
                break;
            }
            self.metrics.record_lock_contention(&record.id);
        }

        let Some((position, spec, claims)) = chosen else {
            self.diagnose_stall(record);
            if !record.uncommitted_events().is_empty() {
                self.commit(record).await?;
            }
            return Ok(None);
        };
        let node_id = spec.node_id.clone();
        // Taken after the acquire, so a rollback must also release `claims`.
        let checkpoint = record.clone();

        let staging_path = if self.config.execution.stage_on_dispatch {
            match self
                .staging
                .create_staging(&record.repo_root, &record.id, &node_id)
                .await
            {
                Ok(path) => Some(path),
                Err(error) => {
                    record.locks.release(&claims, &node_id);
                    tracing::warn!("Staging failed for {}/{node_id}: {error}", record.id);
                    return Err(error);
                }
            }
        } else {
            None
        };

        record.ready_queue.remove(position);
        record.running.insert(node_id.clone());
        record.last_deadlock = None;
        if let Some(state) = record.nodes.get_mut(&node_id) {
            state.status = NodeStatus::Running;
            state.started_at = Some(Utc::now());
        }
        record.push_event(
            EventKind::TaskStarted,
            Some(node_id.clone()),
            Some(json!({ "droidId": spec.droid_id })),
        );
        if let Err(error) = self.commit_or_restore(record, checkpoint).await {
            record.locks.release(&claims, &node_id);
            if staging_path.is_some()
                && let Err(cleanup) = self
                    .staging
                    .clean_staging(&record.repo_root, &record.id, &node_id)
                    .await
            {
                tracing::warn!("Failed to remove staging of {}/{node_id}: {cleanup}", record.id);
            }
            return Err(error);
        }
        self.metrics.record_task_start(&record.id);

        tracing::debug!("Dispatched {node_id} of {} to {}", record.id, spec.droid_id);
        Ok(Some(NodeSchedule {
            node_id,
            droid_id: spec.droid_id,
            title: spec.title,
            description: spec.description,
            resource_claims: spec.resource_claims,
            staging_path,
        }))
    }

    fn diagnose_stall(&self, record: &mut ExecutionRecord) {
        if !self.config.execution.detect_deadlocks {
            return;
        }
        let Some(report) = self.detector.detect(
            &record.ready_queue,
            &record.running,
            &record.nodes,
            record.locks.lock_state(),
        ) else {
            return;
        };
        if record.last_deadlock.as_ref() == Some(&report.blocked_nodes) {
            return;
        }

        tracing::warn!(
            "Execution {} cannot dispatch any of {} ready nodes (cycle: {:?})",
            record.id,
            report.blocked_nodes.len(),
            report.cycle
        );
        record.last_deadlock = Some(report.blocked_nodes.clone());
        record.push_event(
            EventKind::ExecutionDeadlock,
            None,
            ExecutionRecord::deadlock_payload(&report),
        );
    }

    /// Move a live execution whose nodes are all done to `completed`. Returns whether it did.
    fn check_completion(record: &mut ExecutionRecord) -> bool {
        if record.status.is_terminal() || !record.all_completed() {
            return false;
        }
        record.status = ExecutionStatus::Completed;
        record.push_event(EventKind::ExecutionCompleted, None, None);
        tracing::info!("Execution {} completed", record.id);
        true
    }

    /// Report a running node as completed and unblock its dependents.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, `UnknownNode`, `NodeNotRunning`,
    /// `InvalidTransition` for an aborted execution, or an I/O error.
    pub async fn complete_node(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        detail: Option<Value>,
    ) -> Result<ExecutionSnapshot> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.lock().await;
        if record.status == ExecutionStatus::Aborted {
            return Err(Self::invalid_transition(&record, "complete a node of"));
        }
        record.require_running_node(node_id)?;

        let checkpoint = record.clone();
        let duration_ms = record
            .finish_node(node_id, NodeStatus::Completed)
            .and_then(|finished| finished.duration())
            .map_or(0, |duration| duration.num_milliseconds());
        record.push_event(EventKind::TaskCompleted, Some(node_id.clone()), detail);
        let promoted = record.promote_dependents(node_id);
        let completed = Self::check_completion(&mut record);
        self.commit_or_restore(&mut record, checkpoint).await?;

        self.metrics
            .record_task_complete(&record.id, node_id, duration_ms);
        if completed {
            self.metrics.record_execution_complete(&record.id);
        }
        tracing::debug!(
            "Node {node_id} of {} completed, {} dependents ready",
            record.id,
            promoted.len()
        );
        Ok(record.snapshot())
    }

    /// Report a running node as failed. The execution fails with it.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, `UnknownNode`, `NodeNotRunning`,
    /// `InvalidTransition` for an aborted execution, or an I/O error.
    pub async fn fail_node(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        detail: Option<Value>,
    ) -> Result<ExecutionSnapshot> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.lock().await;
        if record.status == ExecutionStatus::Aborted {
            return Err(Self::invalid_transition(&record, "fail a node of"));
        }
        record.require_running_node(node_id)?;

        let checkpoint = record.clone();
        record.finish_node(node_id, NodeStatus::Failed);
        record.push_event(EventKind::TaskFailed, Some(node_id.clone()), detail);

        let failing = !record.status.is_terminal();
        if failing {
            record.status = ExecutionStatus::Failed;
            record.push_event(
                EventKind::ExecutionFailed,
                Some(node_id.clone()),
                None,
            );
        }
        self.commit_or_restore(&mut record, checkpoint).await?;

        self.metrics.record_task_failed(&record.id);
        if failing {
            self.metrics.record_execution_complete(&record.id);
            tracing::warn!("Execution {} failed at node {node_id}", record.id);
        }
        Ok(record.snapshot())
    }

    /// `running → paused`. Pausing a paused execution is a no-op.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, or `InvalidTransition` from any other status.
    pub async fn pause(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        self.toggle(
            execution_id,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            EventKind::ExecutionPaused,
            "pause",
        )
        .await
    }

    /// `paused → running`. Resuming a running execution is a no-op.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, or `InvalidTransition` from any other status.
    pub async fn resume(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        self.toggle(
            execution_id,
            ExecutionStatus::Paused,
            ExecutionStatus::Running,
            EventKind::ExecutionResumed,
            "resume",
        )
        .await
    }

    async fn toggle(
        &self,
        execution_id: &ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
        kind: EventKind,
        action: &'static str,
    ) -> Result<ExecutionSnapshot> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.lock().await;

        if record.status == to {
            return Ok(record.snapshot());
        }
        if record.status != from {
            return Err(Self::invalid_transition(&record, action));
        }

        let checkpoint = record.clone();
        record.status = to;
        record.push_event(kind, None, None);
        self.commit_or_restore(&mut record, checkpoint).await?;
        tracing::info!("Execution {} {kind}", record.id);
        Ok(record.snapshot())
    }

    /// Abort: release every lock, clear the queues and discard all staging.
    ///
    /// The aborted status is persisted before staging is removed. Aborting an
    /// aborted execution retries the staging removal.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, `InvalidTransition` for a completed or
    /// failed execution, or an I/O error.
    pub async fn abort(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.lock().await;

        match record.status {
            ExecutionStatus::Aborted => {
                self.staging
                    .discard_execution(&record.repo_root, &record.id)
                    .await?;
                return Ok(record.snapshot());
            }
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                return Err(Self::invalid_transition(&record, "abort"));
            }
            ExecutionStatus::Planned | ExecutionStatus::Running | ExecutionStatus::Paused => {}
        }

        let checkpoint = record.clone();
        let in_flight = record.running.len();
        record.status = ExecutionStatus::Aborted;
        record.locks.clear();
        record.ready_queue.clear();
        record.running.clear();
        record.push_event(
            EventKind::ExecutionAborted,
            None,
            Some(json!({ "inFlight": in_flight })),
        );
        self.commit_or_restore(&mut record, checkpoint).await?;
        self.metrics.record_execution_complete(&record.id);

        self.staging
            .discard_execution(&record.repo_root, &record.id)
            .await?;
        tracing::info!("Aborted execution {} ({in_flight} nodes in flight)", record.id);
        Ok(record.snapshot())
    }


    /// Merge the staged outputs of every completed node into the repository.
    ///
    /// The execution status is not changed; conflicts come back in the result.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, or an error from reading state, collecting
    /// staged files or writing the repository.
    pub async fn merge(&self, execution_id: &ExecutionId) -> Result<MergeResult> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.lock().await;

        let completed = record.completed_claims();
        let result = if self.config.persistence.enabled {
            let node_ids: Vec<NodeId> = completed.into_iter().map(|(node_id, _)| node_id).collect();
            self.merger
                .merge(&record.repo_root, &record.id, &node_ids, self.staging.as_ref())
                .await?
        } else {
            self.merger
                .merge_claims(&record.repo_root, &record.id, &completed, self.staging.as_ref())
                .await?
        };

        if result.success {
            record.push_event(
                EventKind::ExecutionMerged,
                None,
                Some(json!({ "mergedFiles": result.merged_files })),
            );
            self.commit(&mut record).await?;
        }
        Ok(result)
    }

    /// Read-only snapshot of one execution.
    ///
    /// # Errors
    /// Returns `UnknownExecution`.
    pub async fn poll(&self, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        let handle = self.handle(execution_id).await?;
        let record = handle.lock().await;
        Ok(record.snapshot())
    }

    /// Snapshots of every known execution, newest first.
    pub async fn list(&self) -> Vec<ExecutionSnapshot> {
        let handles: Vec<RecordHandle> = self.executions.read().await.values().map(Arc::clone).collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.snapshot());
        }
        snapshots.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        snapshots
    }

    /// Diagnose a stalled ready queue on demand without recording anything.
    ///
    /// # Errors
    /// Returns `UnknownExecution`.
    pub async fn deadlock_report(&self, execution_id: &ExecutionId) -> Result<Option<DeadlockReport>> {
        let handle = self.handle(execution_id).await?;
        let record = handle.lock().await;
        Ok(self.detector.detect(
            &record.ready_queue,
            &record.running,
            &record.nodes,
            record.locks.lock_state(),
        ))
    }

    /// Health of every known execution.
    pub async fn health(&self) -> HealthStatus {
        let handles: Vec<RecordHandle> = self.executions.read().await.values().map(Arc::clone).collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        self.health.check(&summaries, Utc::now())
    }

    /// Rebuild an execution from `state.json` and `timeline.jsonl`, replacing any cached record.
    ///
    /// # Errors
    /// Returns `InvalidPlan` for an id that is not a plain directory name,
    /// `UnknownExecution` when nothing is persisted under the id, or an error if
    /// the state cannot be read.
    pub async fn recover(&self, repo_root: &Path, execution_id: &ExecutionId) -> Result<ExecutionSnapshot> {
        execution_id.ensure_path_safe()?;
        let record = self
            .load_record(repo_root, execution_id)
            .await?
            .ok_or_else(|| ExecError::UnknownExecution(execution_id.clone()))?;
        let snapshot = record.snapshot();
        self.track_recovered(&record);
        self.insert(record).await;

        tracing::info!(
            "Recovered execution {execution_id} in status {}",
            snapshot.status
        );
        Ok(snapshot)
    }

    /// Recover every execution persisted under `repo_root`.
    ///
    /// # Errors
    /// Returns the first error hit while listing or loading.
    pub async fn recover_all(&self, repo_root: &Path) -> Result<Vec<ExecutionId>> {
        let ids = self.persistence.list_executions(repo_root).await?;
        for id in &ids {
            self.recover(repo_root, id).await?;
        }
        Ok(ids)
    }

    /// Whether the execution is currently held in memory.
    pub async fn is_cached(&self, execution_id: &ExecutionId) -> bool {
        self.executions.read().await.contains_key(execution_id)
    }

    /// Forget a terminal execution and delete its directory, staging included.
    ///
    /// # Errors
    /// Returns `UnknownExecution`, `InvalidTransition` for a live execution, or an I/O error.
    pub async fn discard(&self, execution_id: &ExecutionId) -> Result<()> {
        let handle = self.handle(execution_id).await?;
        let record = handle.lock().await;
        if !record.status.is_terminal() {
            return Err(Self::invalid_transition(&record, "discard"));
        }

        self.persistence.delete(&record.repo_root, &record.id).await?;
        self.metrics.clear(&record.id);
        drop(record);
        self.executions.write().await.remove(execution_id);
        tracing::debug!("Discarded execution {execution_id}");
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionManager")
            .field("config", &self.config)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}
