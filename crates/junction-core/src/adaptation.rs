// Flow Adapter
// Decides whether the remaining plan should be mutated mid-flight and builds
// the mutated plan. Strictly best-effort: nothing here may abort orchestration.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use junction_oracle::DecisionOracle;
use junction_types::{Plan, PlanStep, StepKind};

use crate::types::{Orchestration, ProgressSnapshot};

// ============================================================================
// Adaptation kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationKind {
    /// Double timeouts, raise retry budget
    RetryWithModification,
    /// Halve timeouts
    Optimize,
    /// Drop steps whose target is known-unavailable
    SkipUnavailable,
    /// Append a synthetic health-check step
    AddValidation,
    /// Downgrade assertion severities one level
    RelaxAssertions,
}

impl AdaptationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdaptationKind::RetryWithModification => "retry_with_modification",
            AdaptationKind::Optimize => "optimize",
            AdaptationKind::SkipUnavailable => "skip_unavailable",
            AdaptationKind::AddValidation => "add_validation",
            AdaptationKind::RelaxAssertions => "relax_assertions",
        }
    }
}

/// Pure classifier from oracle reply text to an adaptation kind.
/// Pluggable so the fragile keyword matching can be swapped or tested
/// without an oracle in the loop.
pub type ReplyClassifier = fn(&str) -> Option<AdaptationKind>;

/// Default keyword classifier over the oracle's free-text reply.
pub fn classify_reply(text: &str) -> Option<AdaptationKind> {
    let lower = text.to_lowercase();
    if lower.contains("retry") {
        return Some(AdaptationKind::RetryWithModification);
    }
    if lower.contains("optimize") || lower.contains("performance") {
        return Some(AdaptationKind::Optimize);
    }
    if lower.contains("skip") || lower.contains("unavailable") {
        return Some(AdaptationKind::SkipUnavailable);
    }
    if lower.contains("validation") {
        return Some(AdaptationKind::AddValidation);
    }
    if lower.contains("relax") || lower.contains("assertion") {
        return Some(AdaptationKind::RelaxAssertions);
    }
    // A vague-but-affirmative reply defaults to the retry adaptation.
    if lower.contains("adapt") || lower.contains("yes") {
        return Some(AdaptationKind::RetryWithModification);
    }
    None
}

// ============================================================================
// Adapter
// ============================================================================

/// Thresholds for the deterministic heuristics run before the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Errors at which the repeated-failure heuristic fires
    pub repeated_failure_threshold: u32,
    /// Average-step-time multiplier that counts as degradation
    pub degradation_factor: f64,
    /// Baseline step duration the degradation check compares against
    pub assumed_step_duration_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            repeated_failure_threshold: 3,
            degradation_factor: 2.0,
            assumed_step_duration_ms: 2_000,
        }
    }
}

/// An adaptation decision: which kind fired and the plan it produced.
#[derive(Debug, Clone)]
pub struct AdaptationOutcome {
    pub kind: AdaptationKind,
    pub plan: Plan,
}

pub struct FlowAdapter {
    oracle: Arc<dyn DecisionOracle>,
    classifier: ReplyClassifier,
    config: AdapterConfig,
    unavailable_targets: RwLock<HashSet<String>>,
}

impl FlowAdapter {
    pub fn new(oracle: Arc<dyn DecisionOracle>) -> Self {
        Self {
            oracle,
            classifier: classify_reply,
            config: AdapterConfig::default(),
            unavailable_targets: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_classifier(mut self, classifier: ReplyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Record a target as currently unreachable, feeding the
    /// target-unavailability heuristic and the skip transform.
    pub async fn mark_target_unavailable(&self, target: &str) {
        self.unavailable_targets
            .write()
            .await
            .insert(target.to_string());
    }

    pub async fn mark_target_available(&self, target: &str) {
        self.unavailable_targets.write().await.remove(target);
    }

    /// Decide whether the remaining plan should be adapted and, if so,
    /// build the adapted plan. Returns `None` on "no adaptation" and on any
    /// internal failure, including oracle unavailability.
    pub async fn adapt_flow(
        &self,
        orchestration: &Orchestration,
        progress: &ProgressSnapshot,
    ) -> Option<AdaptationOutcome> {
        let kind = self.select_kind(orchestration, progress).await?;
        let unavailable = self.unavailable_targets.read().await.clone();
        let plan = apply_adaptation(kind, &orchestration.plan, &unavailable);
        Some(AdaptationOutcome { kind, plan })
    }

    /// Deterministic heuristics first; the oracle is only a fallback.
    async fn select_kind(
        &self,
        orchestration: &Orchestration,
        progress: &ProgressSnapshot,
    ) -> Option<AdaptationKind> {
        if orchestration.error_count >= self.config.repeated_failure_threshold {
            return Some(AdaptationKind::RetryWithModification);
        }

        if progress.completed_steps > 0 {
            let avg_step_ms = progress.elapsed_ms / progress.completed_steps as u64;
            let degraded_ms =
                self.config.assumed_step_duration_ms as f64 * self.config.degradation_factor;
            if avg_step_ms as f64 > degraded_ms {
                return Some(AdaptationKind::Optimize);
            }
        }

        {
            let unavailable = self.unavailable_targets.read().await;
            if orchestration
                .plan
                .steps
                .iter()
                .any(|step| unavailable.contains(&step.target))
            {
                return Some(AdaptationKind::SkipUnavailable);
            }
        }

        let prompt = build_prompt(orchestration, progress);
        let answer = self.oracle.ask(&prompt).await;
        if !answer.success {
            tracing::warn!(
                orchestration_id = %orchestration.orchestration_id,
                error = answer.error_message.as_deref().unwrap_or("unknown"),
                "oracle unavailable, skipping adaptation"
            );
            return None;
        }
        (self.classifier)(&answer.text)
    }
}

/// Terse natural-language summary of the orchestration for the oracle.
fn build_prompt(orchestration: &Orchestration, progress: &ProgressSnapshot) -> String {
    format!(
        "Test orchestration {} is {:?}: {} of {} steps complete, {} errors, \
         {} ms elapsed. Should the remaining plan be adapted? \
         Answer with one of: retry, optimize, skip, validation, relax, no.",
        orchestration.orchestration_id,
        orchestration.status,
        progress.completed_steps,
        progress.total_steps,
        orchestration.error_count,
        progress.elapsed_ms,
    )
}

// ============================================================================
// Plan transforms
// ============================================================================

/// Build the adapted plan for `kind`. Scenario metadata, test data, and
/// configuration are carried verbatim; only steps/assertions change. The
/// result is a new plan with a fresh `plan_id`.
pub fn apply_adaptation(kind: AdaptationKind, plan: &Plan, unavailable: &HashSet<String>) -> Plan {
    let mut adapted = plan.clone();
    adapted.plan_id = Uuid::new_v4().to_string();

    match kind {
        AdaptationKind::RetryWithModification => {
            for step in &mut adapted.steps {
                step.timeout_ms = step.timeout_ms.saturating_mul(2);
                step.retry.max_attempts += 2;
                step.retry.backoff_multiplier *= 1.5;
            }
        }
        AdaptationKind::Optimize => {
            for step in &mut adapted.steps {
                step.timeout_ms = (step.timeout_ms / 2).max(1);
            }
        }
        AdaptationKind::SkipUnavailable => {
            adapted
                .steps
                .retain(|step| !unavailable.contains(&step.target));
        }
        AdaptationKind::AddValidation => {
            let probe_id = format!("health-check-{}", Uuid::new_v4());
            adapted
                .steps
                .push(PlanStep::new(probe_id, StepKind::HealthCheck, "health"));
        }
        AdaptationKind::RelaxAssertions => {
            for assertion in &mut adapted.assertions {
                assertion.severity = assertion.severity.downgraded();
            }
        }
    }

    adapted
}

// ============================================================================
// Tests
// ============================================================================
