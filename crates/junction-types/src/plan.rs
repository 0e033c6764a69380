// Test Plan Types
// Immutable plan model shared between the orchestration core and its collaborators

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// Steps
// ============================================================================

/// Kind of target a plan step drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Publish/consume against a message queue topic
    MessageQueue,
    /// Call an HTTP service endpoint
    HttpRequest,
    /// Query or mutate a document/database store
    DatabaseQuery,
    /// Synthetic availability probe appended by adaptation
    HealthCheck,
}

/// Retry policy for a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first
    pub max_attempts: u32,
    /// Multiplier applied to the backoff delay between attempts
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_multiplier: 1.0,
        }
    }
}

/// A single step in a test plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique step identifier within the plan
    pub id: String,
    /// Step kind
    pub kind: StepKind,
    /// Service/topic identifier the step targets
    pub target: String,
    /// Input payload handed to the protocol adapter
    pub input: Value,
    /// Step timeout in milliseconds
    pub timeout_ms: u64,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Human-readable expected outcomes
    pub expected: Vec<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: target.into(),
            input: Value::Null,
            timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            expected: Vec::new(),
        }
    }
}

// ============================================================================
// Assertions
// ============================================================================

/// Severity attached to an assertion rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionSeverity {
    Warning,
    Error,
    Critical,
}

impl AssertionSeverity {
    /// One level down, floored at `Warning`
    pub fn downgraded(self) -> Self {
        match self {
            AssertionSeverity::Critical => AssertionSeverity::Error,
            AssertionSeverity::Error => AssertionSeverity::Warning,
            AssertionSeverity::Warning => AssertionSeverity::Warning,
        }
    }
}

/// An assertion evaluated against the overall plan outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionRule {
    /// Condition expression evaluated by the execution engine
    pub condition: String,
    /// Expected value of the condition
    pub expected: Value,
    pub severity: AssertionSeverity,
}

// ============================================================================
// Plan
// ============================================================================

/// An ordered, immutable test plan.
///
/// Adaptation never mutates a plan in place; it builds a new `Plan` with a
/// fresh `plan_id` so the original stays auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan identifier
    pub plan_id: String,
    /// Short plan name
    pub name: String,
    /// Scenario description
    pub description: String,
    /// Ordered steps
    pub steps: Vec<PlanStep>,
    /// Assertion rules evaluated against the run outcome
    pub assertions: Vec<AssertionRule>,
    /// Scenario test data, carried verbatim through adaptation
    #[serde(default)]
    pub test_data: HashMap<String, Value>,
    /// Scenario configuration, carried verbatim through adaptation
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl Plan {
    pub fn new(name: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            steps,
            assertions: Vec::new(),
            test_data: HashMap::new(),
            config: HashMap::new(),
        }
    }

    /// Distinct targets touched by the plan, in first-seen order
    pub fn targets(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.target) {
                seen.push(step.target.clone());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_downgrade_floors_at_warning() {
        assert_eq!(
            AssertionSeverity::Critical.downgraded(),
            AssertionSeverity::Error
        );
        assert_eq!(
            AssertionSeverity::Error.downgraded(),
            AssertionSeverity::Warning
        );
        assert_eq!(
            AssertionSeverity::Warning.downgraded(),
            AssertionSeverity::Warning
        );
    }

    #[test]
    fn plan_targets_deduplicate_in_order() {
        let plan = Plan::new(
            "orders",
            vec![
                PlanStep::new("s1", StepKind::MessageQueue, "orders.in"),
                PlanStep::new("s2", StepKind::HttpRequest, "billing"),
                PlanStep::new("s3", StepKind::MessageQueue, "orders.in"),
            ],
        );
        assert_eq!(plan.targets(), vec!["orders.in", "billing"]);
    }
}
