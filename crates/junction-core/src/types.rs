// Orchestration Types
// Core state and configuration for one tracked plan execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use junction_types::{Plan, TestStatus};

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of an orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    /// Registered, execution not yet launched
    Initialized,
    /// Execution task launched, monitoring loop active
    Running,
    /// Monitoring suspended by an external caller
    Paused,
    /// Execution resolved with a passed verdict
    Completed,
    /// Execution resolved with a failed verdict or errored
    Failed,
    /// Cancelled by an external caller
    Cancelled,
    /// Pseudo-state returned for unknown orchestration IDs.
    /// Stored state never holds this value.
    NotFound,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Cancelled
        )
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// One in-flight execution of a plan.
///
/// Owned by the Orchestrator for its lifetime; the monitoring loop and
/// external control calls both mutate it, always under its per-entry lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    /// Unique, caller-opaque identifier
    pub orchestration_id: String,
    /// Token linking all messages of this test flow
    pub correlation_id: String,
    /// The plan being executed. Replaced (not mutated) by adaptation.
    pub plan: Plan,
    pub status: OrchestrationStatus,
    /// Errors reported against this orchestration while in flight
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal error text when the run failed
    pub error_message: Option<String>,
}

impl Orchestration {
    pub fn new(plan: Plan) -> Self {
        Self {
            orchestration_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            plan,
            status: OrchestrationStatus::Initialized,
            error_count: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error_message: None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the orchestrator and its monitoring loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Monitoring loop poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Re-check interval while paused, in milliseconds
    pub pause_recheck_ms: u64,
    /// Assumed duration of one step for the linear progress model
    pub assumed_step_duration_ms: u64,
    /// Gap between consecutive trace messages flagged as a timing issue
    pub timing_gap_threshold_ms: u64,
    /// Errors before the repeated-failure heuristic forces an adaptation
    pub repeated_failure_threshold: u32,
    /// Average-step-time multiplier that counts as performance degradation
    pub degradation_factor: f64,
    /// How many related patterns to fetch from memory on failure
    pub similar_pattern_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            pause_recheck_ms: 500,
            // Generous default: overestimating step duration only makes the
            // progress estimate conservative, never wrong.
            assumed_step_duration_ms: 2_000,
            timing_gap_threshold_ms: 300_000,
            repeated_failure_threshold: 3,
            degradation_factor: 2.0,
            similar_pattern_limit: 5,
        }
    }
}

// ============================================================================
// Progress snapshot
// ============================================================================

/// Read-only progress view, recomputed on demand
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub orchestration_id: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub error_count: u32,
    /// Human-readable label of the step currently in flight
    pub current_step: String,
    pub percent_complete: f64,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: u64,
    pub completed: bool,
    pub result: Option<TestStatus>,
}

impl ProgressSnapshot {
    /// Sentinel snapshot for an unknown orchestration ID
    pub fn not_found(orchestration_id: &str) -> Self {
        Self {
            orchestration_id: orchestration_id.to_string(),
            total_steps: 0,
            completed_steps: 0,
            error_count: 0,
            current_step: "Not Found".to_string(),
            percent_complete: 0.0,
            elapsed_ms: 0,
            estimated_remaining_ms: 0,
            completed: false,
            result: None,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event types published on the orchestrator event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    OrchestrationStarted {
        orchestration_id: String,
        plan_id: String,
        correlation_id: String,
        step_count: usize,
        timestamp: DateTime<Utc>,
    },
    OrchestrationPaused {
        orchestration_id: String,
        timestamp: DateTime<Utc>,
    },
    OrchestrationResumed {
        orchestration_id: String,
        timestamp: DateTime<Utc>,
    },
    PlanAdapted {
        orchestration_id: String,
        kind: String,
        new_plan_id: String,
        timestamp: DateTime<Utc>,
    },
    OrchestrationCompleted {
        orchestration_id: String,
        timestamp: DateTime<Utc>,
    },
    OrchestrationFailed {
        orchestration_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    OrchestrationCancelled {
        orchestration_id: String,
        timestamp: DateTime<Utc>,
    },
    TraceCompleted {
        correlation_id: String,
        message_count: usize,
        timestamp: DateTime<Utc>,
    },
}
