// Orchestrator
// Registry and lifecycle driver for plan executions. Each start() spawns one
// driver task that owns the execution handoff, the monitoring loop, and
// finalization; external control calls (pause/resume/cancel) only flip
// signals the driver observes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use junction_memory::{ExecutionHistory, ExecutionPattern, PatternMemory, PatternQuery};
use junction_observability::{emit_event, ObservabilityEvent, ProcessKind};
use junction_oracle::DecisionOracle;
use junction_types::{Plan, TestResult, TestStatus};

use crate::adaptation::FlowAdapter;
use crate::correlation::CorrelationTracker;
use crate::engine::ExecutionEngine;
use crate::error::{CoreError, Result};
use crate::event_bus::EventBus;
use crate::progress::ProgressTracker;
use crate::types::{
    Orchestration, OrchestrationStatus, OrchestratorConfig, OrchestratorEvent, ProgressSnapshot,
};

const COMPONENT: &str = "orchestrator";

// ============================================================================
// Per-orchestration cell
// ============================================================================

/// Mutable state plus control signals for one in-flight orchestration.
/// Cells are shared between the driver task and control calls; the outer
/// registry lock is only ever held long enough to clone the Arc.
struct OrchestrationCell {
    state: RwLock<Orchestration>,
    /// true while paused; the driver waits on this with a bounded recheck
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
    /// At most one plan adaptation per run
    adapted: AtomicBool,
    /// Caller-facing result channel, consumed exactly once at finalization
    verdict: std::sync::Mutex<Option<oneshot::Sender<TestResult>>>,
}

impl OrchestrationCell {
    fn new(orchestration: Orchestration, verdict: oneshot::Sender<TestResult>) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            state: RwLock::new(orchestration),
            pause,
            cancel: CancellationToken::new(),
            adapted: AtomicBool::new(false),
            verdict: std::sync::Mutex::new(Some(verdict)),
        }
    }

    /// Deliver the final result to the caller. Send errors mean the caller
    /// dropped the receiver, which is fine.
    fn deliver_verdict(&self, result: TestResult) {
        let sender = match self.verdict.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    engine: Arc<dyn ExecutionEngine>,
    memory: Arc<dyn PatternMemory>,
    adapter: FlowAdapter,
    progress: ProgressTracker,
    correlation: CorrelationTracker,
    events: EventBus,
    config: OrchestratorConfig,
    cells: RwLock<HashMap<String, Arc<OrchestrationCell>>>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        oracle: Arc<dyn DecisionOracle>,
        memory: Arc<dyn PatternMemory>,
    ) -> Self {
        Self::with_config(engine, oracle, memory, OrchestratorConfig::default())
    }

    pub fn with_config(
        engine: Arc<dyn ExecutionEngine>,
        oracle: Arc<dyn DecisionOracle>,
        memory: Arc<dyn PatternMemory>,
        config: OrchestratorConfig,
    ) -> Self {
        let adapter = FlowAdapter::new(oracle).with_config(crate::adaptation::AdapterConfig {
            repeated_failure_threshold: config.repeated_failure_threshold,
            degradation_factor: config.degradation_factor,
            assumed_step_duration_ms: config.assumed_step_duration_ms,
        });
        Self {
            engine,
            memory,
            adapter,
            progress: ProgressTracker::new(Duration::from_millis(config.assumed_step_duration_ms)),
            correlation: CorrelationTracker::with_gap_threshold(Duration::from_millis(
                config.timing_gap_threshold_ms,
            )),
            events: EventBus::new(),
            config,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Correlation tracker for this orchestrator. External message recorders
    /// feed send/receive events through this handle.
    pub fn correlation(&self) -> &CorrelationTracker {
        &self.correlation
    }

    pub fn adapter(&self) -> &FlowAdapter {
        &self.adapter
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Register a plan and launch its execution. Returns the new
    /// orchestration ID immediately plus a receiver that resolves exactly
    /// once with the final result; the run itself proceeds in a spawned
    /// driver task. A run that is cancelled or whose execution task errors
    /// resolves the receiver with a synthesized failed result.
    pub async fn start(
        self: &Arc<Self>,
        plan: Plan,
    ) -> Result<(String, oneshot::Receiver<TestResult>)> {
        if plan.steps.is_empty() {
            return Err(CoreError::Validation(format!(
                "plan '{}' has no steps",
                plan.name
            )));
        }

        let mut orchestration = Orchestration::new(plan);
        orchestration.status = OrchestrationStatus::Running;
        orchestration.started_at = Some(Utc::now());
        let id = orchestration.orchestration_id.clone();

        self.correlation
            .start_trace(
                &orchestration.correlation_id,
                &orchestration.plan.plan_id,
                &orchestration.plan.description,
            )
            .await;

        // Learning store is best-effort; a write failure never blocks a start.
        let pattern = ExecutionPattern::from_plan(&orchestration.plan);
        if let Err(e) = self.memory.store_pattern(&pattern).await {
            tracing::warn!(orchestration_id = %id, error = %e, "failed to store execution pattern");
        }

        self.progress.update(&orchestration).await;

        emit_event(
            Level::INFO,
            ProcessKind::Core,
            ObservabilityEvent {
                orchestration_id: Some(&id),
                correlation_id: Some(&orchestration.correlation_id),
                plan_id: Some(&orchestration.plan.plan_id),
                status: Some("running"),
                ..ObservabilityEvent::bare("orchestration_started", COMPONENT)
            },
        );
        self.events.publish(OrchestratorEvent::OrchestrationStarted {
            orchestration_id: id.clone(),
            plan_id: orchestration.plan.plan_id.clone(),
            correlation_id: orchestration.correlation_id.clone(),
            step_count: orchestration.plan.steps.len(),
            timestamp: Utc::now(),
        });

        let (verdict_tx, verdict_rx) = oneshot::channel();
        let cell = Arc::new(OrchestrationCell::new(orchestration, verdict_tx));
        self.cells.write().await.insert(id.clone(), cell.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(cell).await;
        });

        Ok((id, verdict_rx))
    }

    /// Driver loop for one orchestration: hand the plan to the execution
    /// engine, then poll progress and adaptation until the result arrives,
    /// honoring pause and cancellation along the way.
    async fn drive(self: Arc<Self>, cell: Arc<OrchestrationCell>) {
        let plan = cell.state.read().await.plan.clone();
        let engine = Arc::clone(&self.engine);
        let (result_tx, mut result_rx) = oneshot::channel::<TestResult>();
        tokio::spawn(async move {
            let result = match engine.execute_test(plan).await {
                Ok(result) => result,
                Err(e) => TestResult::failure(format!("execution engine error: {e}")),
            };
            // The receiver outlives cancellation, so a late result still
            // lands and drives history recording.
            let _ = result_tx.send(result);
        });

        let mut pause_rx = cell.pause.subscribe();
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let recheck = Duration::from_millis(self.config.pause_recheck_ms);

        loop {
            tokio::select! {
                res = &mut result_rx => {
                    let result = res.unwrap_or_else(|_| {
                        TestResult::failure("execution task dropped without a result")
                    });
                    self.finalize(&cell, result).await;
                    return;
                }
                _ = cell.cancel.cancelled() => {
                    self.finalize_cancelled(&cell, result_rx).await;
                    return;
                }
                _ = tokio::time::sleep(poll) => {
                    if *pause_rx.borrow_and_update() {
                        // Bounded wait so a missed notification can never
                        // wedge the loop; completion and cancellation stay
                        // responsive through the outer select.
                        tokio::select! {
                            _ = pause_rx.changed() => {}
                            _ = tokio::time::sleep(recheck) => {}
                        }
                        continue;
                    }
                    self.monitor_iteration(&cell).await;
                }
            }
        }
    }

    /// One monitoring tick: ask the flow adapter whether the remaining plan
    /// should change, then refresh the progress model.
    async fn monitor_iteration(&self, cell: &OrchestrationCell) {
        let orchestration = cell.state.read().await.clone();

        if !cell.adapted.load(Ordering::Acquire) {
            let snapshot = self.progress.get(&orchestration.orchestration_id).await;
            if let Some(outcome) = self.adapter.adapt_flow(&orchestration, &snapshot).await {
                cell.adapted.store(true, Ordering::Release);
                let new_plan_id = outcome.plan.plan_id.clone();
                cell.state.write().await.plan = outcome.plan;

                emit_event(
                    Level::INFO,
                    ProcessKind::Core,
                    ObservabilityEvent {
                        orchestration_id: Some(&orchestration.orchestration_id),
                        plan_id: Some(&new_plan_id),
                        detail: Some(outcome.kind.as_str()),
                        ..ObservabilityEvent::bare("plan_adapted", COMPONENT)
                    },
                );
                self.events.publish(OrchestratorEvent::PlanAdapted {
                    orchestration_id: orchestration.orchestration_id.clone(),
                    kind: outcome.kind.as_str().to_string(),
                    new_plan_id,
                    timestamp: Utc::now(),
                });
            }
        }

        self.progress.update(&orchestration).await;
    }

    async fn finalize(&self, cell: &OrchestrationCell, result: TestResult) {
        let orchestration = {
            let mut state = cell.state.write().await;
            state.ended_at = Some(Utc::now());
            state.status = if result.is_passed() {
                OrchestrationStatus::Completed
            } else {
                OrchestrationStatus::Failed
            };
            state.error_message = result.failure_reason.clone();
            state.clone()
        };
        let id = orchestration.orchestration_id.clone();

        self.progress
            .mark_completed(&orchestration, result.status)
            .await;

        let history = ExecutionHistory {
            orchestration_id: id.clone(),
            plan_id: orchestration.plan.plan_id.clone(),
            correlation_id: orchestration.correlation_id.clone(),
            status: result.status,
            duration_ms: result.duration_ms(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.memory.store_history(&history).await {
            tracing::warn!(orchestration_id = %id, error = %e, "failed to record execution history");
        }

        if result.status == TestStatus::Failed {
            self.surface_similar_patterns(&orchestration).await;
        }

        // Flow analysis needs the live trace, so it runs just before
        // completion retires it to a summary.
        let issues = self
            .correlation
            .analyze_flow(&orchestration.correlation_id)
            .await;
        for issue in &issues {
            tracing::warn!(
                orchestration_id = %id,
                correlation_id = %orchestration.correlation_id,
                issue = ?issue.kind,
                "{}", issue.description
            );
        }
        if let Some(summary) = self
            .correlation
            .complete_trace(&orchestration.correlation_id)
            .await
        {
            self.events.publish(OrchestratorEvent::TraceCompleted {
                correlation_id: summary.correlation_id.clone(),
                message_count: summary.message_count,
                timestamp: Utc::now(),
            });
        }

        let (event_name, status_label) = if result.is_passed() {
            ("orchestration_completed", "completed")
        } else {
            ("orchestration_failed", "failed")
        };
        emit_event(
            Level::INFO,
            ProcessKind::Core,
            ObservabilityEvent {
                orchestration_id: Some(&id),
                correlation_id: Some(&orchestration.correlation_id),
                plan_id: Some(&orchestration.plan.plan_id),
                status: Some(status_label),
                detail: orchestration.error_message.as_deref(),
                ..ObservabilityEvent::bare(event_name, COMPONENT)
            },
        );
        if result.is_passed() {
            self.events.publish(OrchestratorEvent::OrchestrationCompleted {
                orchestration_id: id.clone(),
                timestamp: Utc::now(),
            });
        } else {
            self.events.publish(OrchestratorEvent::OrchestrationFailed {
                orchestration_id: id.clone(),
                reason: orchestration
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "test failed".to_string()),
                timestamp: Utc::now(),
            });
        }

        // Retire from the active registry. Progress stays queryable as a
        // completed snapshot; status reads now return the sentinel.
        self.cells.write().await.remove(&id);
        cell.deliver_verdict(result);
    }

    /// On failure, look up similar known patterns so operators see related
    /// history next to the failure. Best-effort, log-only.
    async fn surface_similar_patterns(&self, orchestration: &Orchestration) {
        let query = PatternQuery::from_plan(&orchestration.plan);
        match self
            .memory
            .find_similar_patterns(&query, self.config.similar_pattern_limit)
            .await
        {
            Ok(patterns) if !patterns.is_empty() => {
                let names: Vec<&str> = patterns.iter().map(|p| p.name.as_str()).collect();
                tracing::info!(
                    orchestration_id = %orchestration.orchestration_id,
                    similar = ?names,
                    "similar execution patterns on record"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    orchestration_id = %orchestration.orchestration_id,
                    error = %e,
                    "pattern lookup failed"
                );
            }
        }
    }

    /// Cancellation is cooperative: the run retires immediately, but the
    /// execution task keeps running and its own resolution still determines
    /// history recording, so a detached waiter holds the result channel open.
    async fn finalize_cancelled(
        &self,
        cell: &OrchestrationCell,
        result_rx: oneshot::Receiver<TestResult>,
    ) {
        let orchestration = {
            let mut state = cell.state.write().await;
            state.ended_at = Some(Utc::now());
            state.status = OrchestrationStatus::Cancelled;
            state.clone()
        };
        let id = orchestration.orchestration_id.clone();

        let memory = Arc::clone(&self.memory);
        let waiter_id = id.clone();
        let plan_id = orchestration.plan.plan_id.clone();
        let correlation_id = orchestration.correlation_id.clone();
        tokio::spawn(async move {
            let Ok(result) = result_rx.await else {
                return;
            };
            let history = ExecutionHistory {
                orchestration_id: waiter_id.clone(),
                plan_id,
                correlation_id,
                status: result.status,
                duration_ms: result.duration_ms(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = memory.store_history(&history).await {
                tracing::warn!(
                    orchestration_id = %waiter_id,
                    error = %e,
                    "failed to record execution history after cancel"
                );
            }
        });

        if self
            .correlation
            .complete_trace(&orchestration.correlation_id)
            .await
            .is_some()
        {
            tracing::debug!(correlation_id = %orchestration.correlation_id, "trace retired on cancel");
        }
        self.progress.cleanup(&id).await;

        emit_event(
            Level::INFO,
            ProcessKind::Core,
            ObservabilityEvent {
                orchestration_id: Some(&id),
                correlation_id: Some(&orchestration.correlation_id),
                status: Some("cancelled"),
                ..ObservabilityEvent::bare("orchestration_cancelled", COMPONENT)
            },
        );
        self.events.publish(OrchestratorEvent::OrchestrationCancelled {
            orchestration_id: id.clone(),
            timestamp: Utc::now(),
        });

        self.cells.write().await.remove(&id);
        cell.deliver_verdict(TestResult::failure("orchestration cancelled"));
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Suspend monitoring for a running orchestration. Returns whether a
    /// transition happened; pausing an already-paused, terminal, or unknown
    /// orchestration is a no-op returning false.
    pub async fn pause(&self, orchestration_id: &str) -> bool {
        let Some(cell) = self.cell(orchestration_id).await else {
            return false;
        };
        {
            let mut state = cell.state.write().await;
            if state.status != OrchestrationStatus::Running {
                return false;
            }
            state.status = OrchestrationStatus::Paused;
        }
        let _ = cell.pause.send(true);

        emit_event(
            Level::INFO,
            ProcessKind::Core,
            ObservabilityEvent {
                orchestration_id: Some(orchestration_id),
                status: Some("paused"),
                ..ObservabilityEvent::bare("orchestration_paused", COMPONENT)
            },
        );
        self.events.publish(OrchestratorEvent::OrchestrationPaused {
            orchestration_id: orchestration_id.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Resume a paused orchestration. Same transition semantics as `pause`.
    pub async fn resume(&self, orchestration_id: &str) -> bool {
        let Some(cell) = self.cell(orchestration_id).await else {
            return false;
        };
        {
            let mut state = cell.state.write().await;
            if state.status != OrchestrationStatus::Paused {
                return false;
            }
            state.status = OrchestrationStatus::Running;
        }
        let _ = cell.pause.send(false);

        emit_event(
            Level::INFO,
            ProcessKind::Core,
            ObservabilityEvent {
                orchestration_id: Some(orchestration_id),
                status: Some("running"),
                ..ObservabilityEvent::bare("orchestration_resumed", COMPONENT)
            },
        );
        self.events.publish(OrchestratorEvent::OrchestrationResumed {
            orchestration_id: orchestration_id.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Request cooperative cancellation. The driver task observes the token
    /// and finalizes; the in-flight execution is abandoned, not interrupted.
    pub async fn cancel(&self, orchestration_id: &str) -> bool {
        let Some(cell) = self.cell(orchestration_id).await else {
            return false;
        };
        if cell.state.read().await.status.is_terminal() {
            return false;
        }
        cell.cancel.cancel();
        true
    }

    /// Report an error observed against an in-flight orchestration. Feeds
    /// the repeated-failure adaptation heuristic.
    pub async fn record_error(&self, orchestration_id: &str, detail: &str) -> bool {
        let Some(cell) = self.cell(orchestration_id).await else {
            return false;
        };
        let count = {
            let mut state = cell.state.write().await;
            state.error_count += 1;
            state.error_count
        };
        emit_event(
            Level::WARN,
            ProcessKind::Core,
            ObservabilityEvent {
                orchestration_id: Some(orchestration_id),
                detail: Some(detail),
                ..ObservabilityEvent::bare("orchestration_error", COMPONENT)
            },
        );
        tracing::debug!(orchestration_id, error_count = count, "error recorded");
        true
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Status of an orchestration, or the `NotFound` sentinel for IDs that
    /// were never registered or have already retired.
    pub async fn status(&self, orchestration_id: &str) -> OrchestrationStatus {
        match self.cell(orchestration_id).await {
            Some(cell) => cell.state.read().await.status,
            None => OrchestrationStatus::NotFound,
        }
    }

    /// Progress snapshot. Completed runs keep answering until their record
    /// is cleaned up; unknown IDs get the sentinel snapshot.
    pub async fn progress(&self, orchestration_id: &str) -> ProgressSnapshot {
        self.progress.get(orchestration_id).await
    }

    /// Drop the retained progress record for a finished run. Later
    /// `progress` calls for the ID return the sentinel snapshot. Callers own
    /// when to do this, since completed snapshots stay queryable until then.
    pub async fn cleanup_progress(&self, orchestration_id: &str) {
        self.progress.cleanup(orchestration_id).await;
    }

    /// Full state of an active orchestration.
    pub async fn snapshot(&self, orchestration_id: &str) -> Result<Orchestration> {
        match self.cell(orchestration_id).await {
            Some(cell) => Ok(cell.state.read().await.clone()),
            None => Err(CoreError::NotFound(orchestration_id.to_string())),
        }
    }

    /// IDs of all orchestrations still in the active registry.
    pub async fn active_ids(&self) -> Vec<String> {
        self.cells.read().await.keys().cloned().collect()
    }

    async fn cell(&self, orchestration_id: &str) -> Option<Arc<OrchestrationCell>> {
        self.cells.read().await.get(orchestration_id).cloned()
    }
}
