// Progress Tracker
// Per-orchestration progress records with a linear completion estimate

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use junction_types::TestStatus;

use crate::types::{Orchestration, ProgressSnapshot};

struct ProgressRecord {
    total_steps: usize,
    completed_steps: usize,
    error_count: u32,
    current_step: String,
    started_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
    completed: bool,
    result: Option<TestStatus>,
}

impl ProgressRecord {
    fn new(orchestration: &Orchestration) -> Self {
        let started_at = orchestration.started_at.unwrap_or(orchestration.created_at);
        Self {
            total_steps: orchestration.plan.steps.len(),
            completed_steps: 0,
            error_count: orchestration.error_count,
            current_step: "Starting".to_string(),
            started_at,
            last_update: started_at,
            completed: false,
            result: None,
        }
    }
}

/// Tracks one mutable progress record per orchestration ID, created lazily
/// on first update. Records are keyed per entry; the outer map lock is only
/// held long enough to clone the entry handle.
pub struct ProgressTracker {
    records: RwLock<HashMap<String, Arc<RwLock<ProgressRecord>>>>,
    assumed_step_duration: Duration,
}

impl ProgressTracker {
    pub fn new(assumed_step_duration: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            assumed_step_duration,
        }
    }

    async fn record_for(&self, orchestration: &Orchestration) -> Arc<RwLock<ProgressRecord>> {
        let id = orchestration.orchestration_id.as_str();
        if let Some(record) = self.records.read().await.get(id) {
            return record.clone();
        }
        let mut records = self.records.write().await;
        records
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ProgressRecord::new(orchestration))))
            .clone()
    }

    /// Recompute the completed-step estimate from elapsed time.
    ///
    /// Deliberately simple linear model:
    /// `completed = min(elapsed / assumed_step_duration, total)`.
    /// The stored estimate never decreases.
    pub async fn update(&self, orchestration: &Orchestration) {
        let record = self.record_for(orchestration).await;
        let mut record = record.write().await;
        if record.completed {
            return;
        }

        let now = Utc::now();
        let elapsed_ms = (now - record.started_at).num_milliseconds().max(0) as u64;
        let step_ms = self.assumed_step_duration.as_millis().max(1) as u64;
        let estimate = ((elapsed_ms / step_ms) as usize).min(record.total_steps);

        record.completed_steps = record.completed_steps.max(estimate);
        record.error_count = orchestration.error_count;
        record.current_step = if record.total_steps == 0 {
            "Complete".to_string()
        } else {
            let index = record.completed_steps.min(record.total_steps - 1);
            match orchestration.plan.steps.get(index) {
                Some(step) => format!("Step {} of {}: {}", index + 1, record.total_steps, step.id),
                None => format!("Step {} of {}", index + 1, record.total_steps),
            }
        };
        record.last_update = now;
    }

    /// Idempotent: the first call wins, later calls are no-ops.
    pub async fn mark_completed(&self, orchestration: &Orchestration, result: TestStatus) {
        let record = self.record_for(orchestration).await;
        let mut record = record.write().await;
        if record.completed {
            return;
        }
        record.completed = true;
        record.completed_steps = record.total_steps;
        record.result = Some(result);
        record.error_count = orchestration.error_count;
        record.current_step = "Complete".to_string();
        record.last_update = Utc::now();
    }

    pub async fn get(&self, orchestration_id: &str) -> ProgressSnapshot {
        let record = {
            let records = self.records.read().await;
            match records.get(orchestration_id) {
                Some(record) => record.clone(),
                None => return ProgressSnapshot::not_found(orchestration_id),
            }
        };
        let record = record.read().await;

        let percent_complete = if record.total_steps == 0 {
            100.0
        } else {
            (record.completed_steps as f64 / record.total_steps as f64) * 100.0
        };

        // Elapsed time freezes at the final update once the run completes.
        let elapsed_ms = if record.completed {
            (record.last_update - record.started_at).num_milliseconds().max(0) as u64
        } else {
            (Utc::now() - record.started_at).num_milliseconds().max(0) as u64
        };

        let remaining_steps = record.total_steps.saturating_sub(record.completed_steps);
        let estimated_remaining_ms = if record.completed || record.completed_steps == 0 {
            0
        } else {
            let avg_ms = elapsed_ms / record.completed_steps as u64;
            avg_ms * remaining_steps as u64
        };

        ProgressSnapshot {
            orchestration_id: orchestration_id.to_string(),
            total_steps: record.total_steps,
            completed_steps: record.completed_steps,
            error_count: record.error_count,
            current_step: record.current_step.clone(),
            percent_complete,
            elapsed_ms,
            estimated_remaining_ms,
            completed: record.completed,
            result: record.result,
        }
    }

    /// Remove the tracked record; later `get` calls return the sentinel.
    pub async fn cleanup(&self, orchestration_id: &str) {
        self.records.write().await.remove(orchestration_id);
    }
}

// ============================================================================
// Tests
// ============================================================================
