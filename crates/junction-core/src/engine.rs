use async_trait::async_trait;

use junction_types::{Plan, TestResult};

/// The external execution engine the orchestrator delegates plan runs to.
///
/// Opaque to this core: once launched the task runs to its own resolution.
/// An `Err` from `execute_test` is captured as the orchestration's terminal
/// error and surfaced to the caller as a synthesized failed result.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute_test(&self, plan: Plan) -> anyhow::Result<TestResult>;
}
