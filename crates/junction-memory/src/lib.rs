pub mod store;

pub use store::FileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use junction_types::{Plan, TestStatus};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Shape of a plan recorded for later similarity lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPattern {
    pub pattern_id: String,
    pub plan_id: String,
    pub name: String,
    pub step_count: usize,
    /// Distinct targets the plan touched, in first-seen order
    pub targets: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPattern {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            pattern_id: Uuid::new_v4().to_string(),
            plan_id: plan.plan_id.clone(),
            name: plan.name.clone(),
            step_count: plan.steps.len(),
            targets: plan.targets(),
            created_at: Utc::now(),
        }
    }
}

/// One finished orchestration, appended to the durable history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub orchestration_id: String,
    pub plan_id: String,
    pub correlation_id: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Query context for similarity lookup: what the failing plan looked like.
#[derive(Debug, Clone, Default)]
pub struct PatternQuery {
    pub targets: Vec<String>,
    pub step_count: usize,
}

impl PatternQuery {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            targets: plan.targets(),
            step_count: plan.steps.len(),
        }
    }
}

/// Best-effort learning store. Callers must log and swallow errors from this
/// trait; a memory failure never affects the outcome of an orchestration.
#[async_trait]
pub trait PatternMemory: Send + Sync {
    async fn store_pattern(&self, pattern: &ExecutionPattern) -> Result<()>;

    async fn store_history(&self, history: &ExecutionHistory) -> Result<()>;

    /// Known patterns most similar to the query, best match first.
    async fn find_similar_patterns(
        &self,
        query: &PatternQuery,
        limit: usize,
    ) -> Result<Vec<ExecutionPattern>>;
}
