// Execution Result Types
// Shape of the result the external execution engine hands back for one plan

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::AssertionSeverity;

/// Terminal verdict of one plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Outcome of a single executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub passed: bool,
    pub duration_ms: u64,
    /// Raw output captured from the target, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one assertion rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    pub condition: String,
    pub passed: bool,
    pub severity: AssertionSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

/// One recorded interaction with an external service during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInteraction {
    /// Service/topic identifier
    pub target: String,
    pub success: bool,
    pub response_time_ms: u64,
    /// Correlation identifier linking this interaction to its test flow
    pub correlation_id: String,
}

/// Result of executing a full plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub assertion_results: Vec<AssertionResult>,
    #[serde(default)]
    pub interactions: Vec<ServiceInteraction>,
    /// Reason text when the result is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl TestResult {
    pub fn passed() -> Self {
        let now = Utc::now();
        Self {
            status: TestStatus::Passed,
            started_at: now,
            ended_at: now,
            step_results: Vec::new(),
            assertion_results: Vec::new(),
            interactions: Vec::new(),
            failure_reason: None,
        }
    }

    /// Synthesized failed result carrying an error message.
    /// Used when the execution task itself errors rather than returning a verdict.
    pub fn failure(reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: TestStatus::Failed,
            started_at: now,
            ended_at: now,
            step_results: Vec::new(),
            assertion_results: Vec::new(),
            interactions: Vec::new(),
            failure_reason: Some(reason.into()),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
