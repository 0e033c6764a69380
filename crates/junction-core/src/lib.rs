//! Orchestration and correlation engine.
//!
//! The [`Orchestrator`] owns the lifecycle of test-plan executions: it hands
//! plans to an [`ExecutionEngine`], tracks progress and message correlation
//! while the run is in flight, and consults a decision oracle about adapting
//! the remaining plan. Execution, decision-making, and pattern memory are all
//! injected collaborators; this crate supplies the coordination between them.

pub mod adaptation;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod progress;
pub mod types;

#[cfg(test)]
mod lifecycle_tests;

pub use adaptation::{
    classify_reply, AdaptationKind, AdaptationOutcome, AdapterConfig, FlowAdapter, ReplyClassifier,
};
pub use correlation::{
    CorrelationTracker, FlowIssue, FlowIssueKind, MessageDirection, MessageEvent, TraceSummary,
};
pub use engine::ExecutionEngine;
pub use error::{CoreError, Result};
pub use event_bus::EventBus;
pub use orchestrator::Orchestrator;
pub use progress::ProgressTracker;
pub use types::{
    Orchestration, OrchestrationStatus, OrchestratorConfig, OrchestratorEvent, ProgressSnapshot,
};
