//! Integration tests for dependency ordering, resource locks and the status machine
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::print_stdout,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use droidforge_core::{
    EngineConfig, EventKind, ExecError, ExecutionId, ExecutionPlan, ExecutionStatus, NodeId,
    NodeStatus, PlanNode, TimelineEvent,
};
use droidforge_exec::{ExecutionManager, Listener};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn manager_without_staging() -> ExecutionManager {
    let mut config = EngineConfig::default();
    config.execution.stage_on_dispatch = false;
    ExecutionManager::new(config).expect("manager")
}

async fn planned(manager: &ExecutionManager, repo: &Path, plan: &ExecutionPlan) -> ExecutionId {
    let snapshot = manager.plan(repo, plan, None).await.expect("plan");
    assert_eq!(snapshot.status, ExecutionStatus::Planned);
    let id = snapshot.execution_id;
    manager.start(&id).await.expect("start");
    id
}

async fn next_id(manager: &ExecutionManager, id: &ExecutionId) -> Option<String> {
    manager
        .request_next(id)
        .await
        .expect("request_next")
        .map(|task| task.node_id.as_str().to_owned())
}

async fn complete(manager: &ExecutionManager, id: &ExecutionId, node: &str) {
    manager
        .complete_node(id, &NodeId::from(node), None)
        .await
        .expect("complete_node");
}

#[tokio::test]
async fn test_plan_then_build_and_test_in_parallel() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![
        PlanNode::new("plan", "df-planner").with_title("Plan the change"),
        PlanNode::new("build", "df-builder").with_claims(["src/**"]),
        PlanNode::new("test", "df-tester").with_claims(["tests/**"]),
    ])
    .with_edge("plan", "build")
    .with_edge("plan", "test")
    .with_concurrency(2);
    let id = planned(&manager, repo.path(), &plan).await;

    let first = manager.request_next(&id).await.expect("request_next").expect("plan node");
    assert_eq!(first.node_id, NodeId::from("plan"));
    assert_eq!(first.title.as_deref(), Some("Plan the change"));
    assert!(first.staging_path.is_none());
    assert_eq!(next_id(&manager, &id).await, None);

    complete(&manager, &id, "plan").await;
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("build"));
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("test"));

    let running = manager.poll(&id).await.expect("poll");
    assert_eq!(running.running.len(), 2);
    assert_eq!(running.locks.len(), 2);

    complete(&manager, &id, "test").await;
    complete(&manager, &id, "build").await;

    let done = manager.poll(&id).await.expect("poll");
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(done.locks.is_empty());
    assert!(done.running.is_empty());
    assert!(done.nodes.iter().all(|node| node.status == NodeStatus::Completed));
    assert_eq!(
        done.timeline.last().map(|event| event.event),
        Some(EventKind::ExecutionCompleted)
    );

    let metrics = manager.metrics().metrics(&id).expect("metrics");
    assert_eq!(metrics.completed_nodes, 3);
    assert_eq!(metrics.peak_concurrency, 2);
    assert!(metrics.finished_at.is_some());
}

#[tokio::test]
async fn test_reversed_claim_order_serializes_without_deadlock() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![
        PlanNode::new("left", "droid").with_claims(["a.txt", "b.txt"]),
        PlanNode::new("right", "droid").with_claims(["b.txt", "a.txt"]),
    ])
    .with_concurrency(2);
    let id = planned(&manager, repo.path(), &plan).await;

    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("left"));
    assert_eq!(next_id(&manager, &id).await, None);
    assert!(manager.deadlock_report(&id).await.expect("report").is_none());

    complete(&manager, &id, "left").await;
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("right"));
    complete(&manager, &id, "right").await;

    let snapshot = manager.poll(&id).await.expect("poll");
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert!(
        !snapshot
            .timeline
            .iter()
            .any(|event| event.event == EventKind::ExecutionDeadlock)
    );
    let metrics = manager.metrics().metrics(&id).expect("metrics");
    assert!(metrics.lock_contention_events >= 1);
}

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![
        PlanNode::new("one", "droid"),
        PlanNode::new("two", "droid"),
        PlanNode::new("three", "droid"),
    ])
    .with_concurrency(1);
    let id = planned(&manager, repo.path(), &plan).await;

    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("one"));
    assert_eq!(next_id(&manager, &id).await, None);
    complete(&manager, &id, "one").await;
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("two"));
    assert_eq!(next_id(&manager, &id).await, None);
}

#[tokio::test]
async fn test_default_concurrency_comes_from_config() {
    let repo = TempDir::new().expect("temp dir");
    let mut config = EngineConfig::default();
    config.execution.stage_on_dispatch = false;
    config.execution.default_concurrency = 0;
    let manager = ExecutionManager::new(config).expect("manager");

    let plan = ExecutionPlan::new(vec![PlanNode::new("one", "droid"), PlanNode::new("two", "droid")]);
    let snapshot = manager.plan(repo.path(), &plan, None).await.expect("plan");
    assert_eq!(snapshot.concurrency, 1);
}

#[tokio::test]
async fn test_completion_releases_exactly_its_own_claims() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![
        PlanNode::new("first", "droid").with_claims(["f1"]),
        PlanNode::new("second", "droid").with_claims(["f2"]),
        PlanNode::new("both", "droid").with_claims(["f1", "f2"]),
    ])
    .with_concurrency(3);
    let id = planned(&manager, repo.path(), &plan).await;

    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("first"));
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("second"));
    assert_eq!(next_id(&manager, &id).await, None);

    complete(&manager, &id, "first").await;
    let snapshot = manager.poll(&id).await.expect("poll");
    let held: Vec<&str> = snapshot.locks.iter().map(|lock| lock.resource.as_str()).collect();
    assert_eq!(held, vec!["f2"]);
    assert_eq!(next_id(&manager, &id).await, None);

    complete(&manager, &id, "second").await;
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("both"));
}

#[tokio::test]
async fn test_node_failure_fails_the_execution() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![
        PlanNode::new("flaky", "droid").with_claims(["x"]),
        PlanNode::new("steady", "droid").with_claims(["y"]),
        PlanNode::new("after", "droid"),
    ])
    .with_edge("flaky", "after")
    .with_concurrency(2);
    let id = planned(&manager, repo.path(), &plan).await;

    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("flaky"));
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("steady"));

    let failed = manager
        .fail_node(&id, &NodeId::from("flaky"), Some(serde_json::json!({"reason": "tests red"})))
        .await
        .expect("fail_node");
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(next_id(&manager, &id).await, None);

    // In-flight work may still report back without reviving the execution.
    let finished = manager
        .complete_node(&id, &NodeId::from("steady"), None)
        .await
        .expect("complete after failure");
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(
        finished.node(&NodeId::from("after")).map(|node| node.status),
        Some(NodeStatus::Pending)
    );
    assert!(finished.locks.is_empty());
}

#[tokio::test]
async fn test_pause_and_resume_emit_events() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Listener = Arc::new(move |event: &TimelineEvent| {
        sink.lock().expect("sink").push(event.event);
    });
    manager.events().subscribe_all(listener);

    let plan = ExecutionPlan::new(vec![PlanNode::new("only", "droid")]);
    let id = planned(&manager, repo.path(), &plan).await;

    manager.pause(&id).await.expect("pause");
    manager.pause(&id).await.expect("pause twice");
    assert_eq!(next_id(&manager, &id).await, None);
    assert!(matches!(
        manager.start(&id).await,
        Err(ExecError::InvalidTransition { .. })
    ));

    manager.resume(&id).await.expect("resume");
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("only"));
    complete(&manager, &id, "only").await;
    assert!(matches!(
        manager.pause(&id).await,
        Err(ExecError::InvalidTransition { .. })
    ));

    let kinds = seen.lock().expect("seen").clone();
    assert_eq!(
        kinds,
        vec![
            EventKind::TaskReady,
            EventKind::ExecutionPlanned,
            EventKind::ExecutionStarted,
            EventKind::ExecutionPaused,
            EventKind::ExecutionResumed,
            EventKind::TaskStarted,
            EventKind::TaskCompleted,
            EventKind::ExecutionCompleted,
        ]
    );
}

#[tokio::test]
async fn test_replanning_a_started_execution_is_rejected() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![PlanNode::new("only", "droid")]);
    let id = planned(&manager, repo.path(), &plan).await;

    let again = manager.plan(repo.path(), &plan, Some(id.clone())).await;
    assert!(matches!(again, Err(ExecError::InvalidTransition { .. })));
    assert_eq!(
        manager.poll(&id).await.expect("poll").status,
        ExecutionStatus::Running
    );
}

#[tokio::test]
async fn test_health_reports_counts() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![PlanNode::new("only", "droid")]);
    let running = planned(&manager, repo.path(), &plan).await;
    let paused = planned(&manager, repo.path(), &plan).await;
    manager.pause(&paused).await.expect("pause");

    let health = manager.health().await;
    assert!(health.healthy);
    assert_eq!(health.active_executions, 1);
    assert_eq!(health.paused_executions, 1);
    assert!(manager.is_cached(&running).await);
}

#[tokio::test]
async fn test_overlapping_claims_are_reported_at_plan_time() {
    let repo = TempDir::new().expect("temp dir");
    let manager = manager_without_staging();
    let plan = ExecutionPlan::new(vec![
        PlanNode::new("wide", "droid").with_claims(["src/**"]),
        PlanNode::new("narrow", "droid").with_claims(["src/lib.rs"]),
        PlanNode::new("docs", "droid").with_claims(["docs/**"]),
    ]);
    let snapshot = manager.plan(repo.path(), &plan, None).await.expect("plan");

    let planned = snapshot
        .timeline
        .iter()
        .find(|event| event.event == EventKind::ExecutionPlanned)
        .expect("planned event");
    let overlaps = planned
        .payload
        .as_ref()
        .and_then(|payload| payload.get("claimOverlaps"))
        .and_then(serde_json::Value::as_array)
        .expect("overlap list");
    assert_eq!(overlaps.len(), 1);
    assert_eq!(overlaps[0].get("first"), Some(&serde_json::json!("wide")));
    assert_eq!(overlaps[0].get("secondClaim"), Some(&serde_json::json!("src/lib.rs")));

    // Exact-key locking is unchanged: both nodes dispatch together.
    let id = snapshot.execution_id;
    manager.start(&id).await.expect("start");
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("wide"));
    assert_eq!(next_id(&manager, &id).await.as_deref(), Some("narrow"));
}

#[tokio::test]
async fn test_manager_reads_repository_config() {
    let repo = TempDir::new().expect("temp dir");
    let config_path = EngineConfig::repo_config_path(repo.path());
    std::fs::create_dir_all(config_path.parent().expect("state dir")).expect("create state dir");
    std::fs::write(
        &config_path,
        "[execution]\ndefault_concurrency = 3\nstage_on_dispatch = false\n",
    )
    .expect("write config");

    let manager = ExecutionManager::for_repo(repo.path()).expect("manager");
    assert_eq!(manager.config().execution.default_concurrency, 3);

    let plan = ExecutionPlan::new(vec![PlanNode::new("one", "droid")]);
    let snapshot = manager.plan(repo.path(), &plan, None).await.expect("plan");
    assert_eq!(snapshot.concurrency, 3);
    manager.start(&snapshot.execution_id).await.expect("start");
    let task = manager
        .request_next(&snapshot.execution_id)
        .await
        .expect("request_next")
        .expect("task");
    assert!(task.staging_path.is_none());
}
