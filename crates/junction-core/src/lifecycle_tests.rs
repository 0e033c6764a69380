// End-to-end lifecycle tests driving the orchestrator through a real tokio
// runtime with scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

use junction_memory::FileStore;
use junction_oracle::CannedOracle;
use junction_types::{Plan, PlanStep, StepKind, TestResult, TestStatus};

use crate::engine::ExecutionEngine;
use crate::error::CoreError;
use crate::orchestrator::Orchestrator;
use crate::types::{OrchestrationStatus, OrchestratorConfig, OrchestratorEvent};

/// Engine that resolves immediately with a fixed result.
struct InstantEngine(TestResult);

#[async_trait]
impl ExecutionEngine for InstantEngine {
    async fn execute_test(&self, _plan: Plan) -> anyhow::Result<TestResult> {
        Ok(self.0.clone())
    }
}

/// Engine that blocks until the test releases it through a channel,
/// so the run stays in flight for as long as the test needs.
struct GateEngine {
    slot: Mutex<Option<oneshot::Receiver<TestResult>>>,
}

impl GateEngine {
    fn new() -> (Arc<Self>, oneshot::Sender<TestResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                slot: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

#[async_trait]
impl ExecutionEngine for GateEngine {
    async fn execute_test(&self, _plan: Plan) -> anyhow::Result<TestResult> {
        let rx = self.slot.lock().await.take();
        match rx {
            Some(rx) => Ok(rx
                .await
                .unwrap_or_else(|_| TestResult::failure("gate dropped"))),
            None => Ok(TestResult::passed()),
        }
    }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_ms: 10,
        pause_recheck_ms: 10,
        ..OrchestratorConfig::default()
    }
}

fn checkout_plan() -> Plan {
    Plan::new(
        "checkout",
        vec![
            PlanStep::new("publish-order", StepKind::MessageQueue, "orders.in"),
            PlanStep::new("charge-card", StepKind::HttpRequest, "billing"),
            PlanStep::new("verify-row", StepKind::DatabaseQuery, "orders-db"),
        ],
    )
}

fn build(engine: Arc<dyn ExecutionEngine>, dir: &std::path::Path) -> Arc<Orchestrator> {
    let memory = Arc::new(FileStore::new(dir).expect("store"));
    let oracle = Arc::new(CannedOracle::new(vec!["everything looks fine"]));
    Arc::new(Orchestrator::with_config(
        engine,
        oracle,
        memory,
        fast_config(),
    ))
}

/// Drain the event stream until `pred` matches or the timeout elapses.
async fn wait_for<F>(
    rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
    pred: F,
) -> OrchestratorEvent
where
    F: Fn(&OrchestratorEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn passed_run_completes_and_retires() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = build(Arc::new(InstantEngine(TestResult::passed())), dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;

    // The caller-facing result channel resolves with the verdict.
    let result = verdict.await.expect("verdict");
    assert!(result.is_passed());

    // Retired from the active registry, progress retained as completed.
    assert_eq!(
        orchestrator.status(&id).await,
        OrchestrationStatus::NotFound
    );
    assert!(orchestrator.active_ids().await.is_empty());

    let progress = orchestrator.progress(&id).await;
    assert!(progress.completed);
    assert_eq!(progress.percent_complete, 100.0);
    assert_eq!(progress.completed_steps, 3);
    assert_eq!(progress.result, Some(TestStatus::Passed));
    assert_eq!(progress.current_step, "Complete");
}

#[tokio::test]
async fn failed_run_reports_reason_and_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = build(
        Arc::new(InstantEngine(TestResult::failure("billing declined"))),
        dir.path(),
    );
    let mut events = orchestrator.events().subscribe();

    let (id, verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    let event = wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationFailed { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;
    let result = verdict.await.expect("verdict");
    assert_eq!(result.failure_reason.as_deref(), Some("billing declined"));
    match event {
        OrchestratorEvent::OrchestrationFailed { reason, .. } => {
            assert!(reason.contains("billing declined"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let progress = orchestrator.progress(&id).await;
    assert_eq!(progress.result, Some(TestStatus::Failed));

    // History lands in the store as part of finalization.
    let memory = FileStore::new(dir.path()).expect("store");
    let history = memory.load_history().expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].orchestration_id, id);
    assert_eq!(history[0].status, TestStatus::Failed);
}

#[tokio::test]
async fn pause_and_resume_transition_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, release) = GateEngine::new();
    let orchestrator = build(engine, dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, _verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    assert_eq!(orchestrator.status(&id).await, OrchestrationStatus::Running);

    assert!(orchestrator.pause(&id).await);
    assert!(!orchestrator.pause(&id).await);
    assert_eq!(orchestrator.status(&id).await, OrchestrationStatus::Paused);

    assert!(orchestrator.resume(&id).await);
    assert!(!orchestrator.resume(&id).await);
    assert_eq!(orchestrator.status(&id).await, OrchestrationStatus::Running);

    // Resuming a never-paused run is also a no-op.
    release.send(TestResult::passed()).expect("release");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { .. })
    })
    .await;
    assert!(!orchestrator.resume(&id).await);
}

#[tokio::test]
async fn completion_is_processed_while_paused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, release) = GateEngine::new();
    let orchestrator = build(engine, dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, _verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    assert!(orchestrator.pause(&id).await);

    // The engine finishing while paused must still finalize the run.
    release.send(TestResult::passed()).expect("release");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;
    assert!(orchestrator.progress(&id).await.completed);
}

#[tokio::test]
async fn cancellation_retires_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, _release) = GateEngine::new();
    let orchestrator = build(engine, dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    assert!(orchestrator.cancel(&id).await);
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCancelled { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;

    let result = verdict.await.expect("verdict");
    assert!(!result.is_passed());
    assert_eq!(
        result.failure_reason.as_deref(),
        Some("orchestration cancelled")
    );

    assert_eq!(
        orchestrator.status(&id).await,
        OrchestrationStatus::NotFound
    );
    assert!(!orchestrator.cancel(&id).await);
    // Cancelled runs drop their progress record entirely.
    assert_eq!(orchestrator.progress(&id).await.current_step, "Not Found");
}

#[tokio::test]
async fn cancelled_run_still_records_history_when_task_resolves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, release) = GateEngine::new();
    let orchestrator = build(engine, dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    assert!(orchestrator.cancel(&id).await);
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCancelled { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;

    // The caller sees the synthesized cancelled verdict right away.
    let result = verdict.await.expect("verdict");
    assert!(!result.is_passed());

    // Cancellation is cooperative: the engine task's own resolution still
    // determines final history recording.
    release.send(TestResult::passed()).expect("release");
    let memory = FileStore::new(dir.path()).expect("store");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let history = memory.load_history().expect("history");
        if !history.is_empty() {
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].orchestration_id, id);
            assert_eq!(history[0].status, TestStatus::Passed);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history was never recorded after the task resolved"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn progress_record_can_be_dropped_after_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = build(Arc::new(InstantEngine(TestResult::passed())), dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, _verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;
    assert!(orchestrator.progress(&id).await.completed);

    orchestrator.cleanup_progress(&id).await;
    assert_eq!(orchestrator.progress(&id).await.current_step, "Not Found");
}

#[tokio::test]
async fn negated_oracle_reply_never_changes_the_verdict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, release) = GateEngine::new();
    let memory = Arc::new(FileStore::new(dir.path()).expect("store"));
    // This reply contains "adapt", so the keyword classifier flags it as an
    // adaptation; that adaptation must stay telemetry-only.
    let oracle = Arc::new(CannedOracle::new(vec!["no adaptation needed"]));
    let orchestrator = Arc::new(Orchestrator::with_config(
        engine,
        oracle,
        memory,
        fast_config(),
    ));
    let mut events = orchestrator.events().subscribe();

    let (id, verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::PlanAdapted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;

    release.send(TestResult::passed()).expect("release");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;

    let result = verdict.await.expect("verdict");
    assert!(result.is_passed());

    let progress = orchestrator.progress(&id).await;
    assert!(progress.completed);
    assert_eq!(progress.percent_complete, 100.0);
    assert_eq!(
        orchestrator.status(&id).await,
        OrchestrationStatus::NotFound
    );
}

#[tokio::test]
async fn unknown_ids_are_sentinels_not_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = build(Arc::new(InstantEngine(TestResult::passed())), dir.path());

    assert_eq!(
        orchestrator.status("missing").await,
        OrchestrationStatus::NotFound
    );
    let progress = orchestrator.progress("missing").await;
    assert_eq!(progress.current_step, "Not Found");
    assert_eq!(progress.percent_complete, 0.0);

    assert!(matches!(
        orchestrator.snapshot("missing").await,
        Err(CoreError::NotFound(_))
    ));
    assert!(!orchestrator.pause("missing").await);
    assert!(!orchestrator.resume("missing").await);
    assert!(!orchestrator.cancel("missing").await);
    assert!(!orchestrator.record_error("missing", "whatever").await);
}

#[tokio::test]
async fn empty_plan_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = build(Arc::new(InstantEngine(TestResult::passed())), dir.path());

    let result = orchestrator.start(Plan::new("empty", vec![])).await;
    assert!(matches!(result, Err(CoreError::Validation(_))));
    assert!(orchestrator.active_ids().await.is_empty());
}

#[tokio::test]
async fn repeated_errors_adapt_the_plan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, release) = GateEngine::new();
    let memory = Arc::new(FileStore::new(dir.path()).expect("store"));
    // Unavailable oracle: the repeated-failure heuristic must fire on its own.
    let oracle = Arc::new(CannedOracle::unavailable("offline"));
    let config = OrchestratorConfig {
        repeated_failure_threshold: 2,
        ..fast_config()
    };
    let orchestrator = Arc::new(Orchestrator::with_config(engine, oracle, memory, config));
    let mut events = orchestrator.events().subscribe();

    let (id, _verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    let original_timeout = orchestrator.snapshot(&id).await.expect("snapshot").plan.steps[0].timeout_ms;

    assert!(orchestrator.record_error(&id, "connection reset").await);
    assert!(orchestrator.record_error(&id, "connection reset").await);

    let event = wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::PlanAdapted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;
    match event {
        OrchestratorEvent::PlanAdapted { kind, .. } => {
            assert_eq!(kind, "retry_with_modification");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let adapted = orchestrator.snapshot(&id).await.expect("snapshot").plan;
    assert_eq!(adapted.steps[0].timeout_ms, original_timeout * 2);

    release.send(TestResult::passed()).expect("release");
    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { .. })
    })
    .await;
}

#[tokio::test]
async fn oracle_outage_never_blocks_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let memory = Arc::new(FileStore::new(dir.path()).expect("store"));
    let oracle = Arc::new(CannedOracle::unavailable("offline"));
    let (engine, release) = GateEngine::new();
    let orchestrator = Arc::new(Orchestrator::with_config(
        engine,
        oracle,
        memory,
        fast_config(),
    ));
    let mut events = orchestrator.events().subscribe();

    let (id, _verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    // Let monitoring tick a few times against the dead oracle first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.send(TestResult::passed()).expect("release");

    wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::OrchestrationCompleted { orchestration_id, .. }
            if *orchestration_id == id)
    })
    .await;
    assert_eq!(
        orchestrator.progress(&id).await.result,
        Some(TestStatus::Passed)
    );
}

#[tokio::test]
async fn trace_is_retired_with_a_summary_on_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (engine, release) = GateEngine::new();
    let orchestrator = build(engine, dir.path());
    let mut events = orchestrator.events().subscribe();

    let (id, _verdict) = orchestrator.start(checkout_plan()).await.expect("start");
    let correlation_id = orchestrator
        .snapshot(&id)
        .await
        .expect("snapshot")
        .correlation_id;

    orchestrator
        .correlation()
        .record_sent(
            &correlation_id,
            "orders.in",
            "order-created",
            serde_json::json!({ "order": 1 }),
            None,
        )
        .await;
    release.send(TestResult::passed()).expect("release");

    let event = wait_for(&mut events, |e| {
        matches!(e, OrchestratorEvent::TraceCompleted { correlation_id: cid, .. }
            if *cid == correlation_id)
    })
    .await;
    match event {
        OrchestratorEvent::TraceCompleted { message_count, .. } => {
            assert_eq!(message_count, 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let summary = orchestrator
        .correlation()
        .trace_summary(&correlation_id)
        .await
        .expect("summary retained");
    assert_eq!(summary.message_count, 1);
}
