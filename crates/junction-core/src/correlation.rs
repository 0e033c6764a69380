// Correlation Tracker
// Records correlated message traffic and flags ordering/timing/missing-response anomalies

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use junction_observability::redact_text;
use junction_types::ServiceInteraction;

/// Completed summaries retained for post-hoc inspection
const MAX_COMPLETED_SUMMARIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Sent,
    Received,
}

/// One recorded message on a correlation trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub direction: MessageDirection,
    /// Topic/channel/service the message went to or came from
    pub target: String,
    pub key: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<ServiceInteraction>,
    pub timestamp: DateTime<Utc>,
}

/// One active trace per correlation ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationTrace {
    pub correlation_id: String,
    pub test_id: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    /// Append-only, in recording order. Recording order is arrival order,
    /// not wall-clock order; the ordering check depends on that.
    pub events: Vec<MessageEvent>,
}

/// Retained view of a completed trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub correlation_id: String,
    pub test_id: String,
    pub message_count: usize,
    pub distinct_targets: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowIssueKind {
    Ordering,
    MissingResponse,
    TimingGap,
}

/// A detected anomaly in a correlated message flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowIssue {
    pub kind: FlowIssueKind,
    pub description: String,
    pub detail: HashMap<String, Value>,
}

/// Tracks active correlation traces and analyzes their message flow.
///
/// The trace map is keyed per entry: the outer lock is held only to clone
/// the entry handle, so recording on one trace never blocks another.
pub struct CorrelationTracker {
    traces: RwLock<HashMap<String, Arc<RwLock<CorrelationTrace>>>>,
    completed: RwLock<HashMap<String, TraceSummary>>,
    gap_threshold: Duration,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::with_gap_threshold(Duration::from_secs(300))
    }

    pub fn with_gap_threshold(gap_threshold: Duration) -> Self {
        Self {
            traces: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            gap_threshold,
        }
    }

    /// Register a new active trace.
    ///
    /// A duplicate correlation ID silently replaces the existing trace and
    /// drops its recorded events. Source behavior preserved as-is; whether
    /// the right intent is error, replace, or merge was never settled.
    pub async fn start_trace(&self, correlation_id: &str, test_id: &str, description: &str) {
        let trace = CorrelationTrace {
            correlation_id: correlation_id.to_string(),
            test_id: test_id.to_string(),
            description: description.to_string(),
            started_at: Utc::now(),
            events: Vec::new(),
        };
        self.traces
            .write()
            .await
            .insert(correlation_id.to_string(), Arc::new(RwLock::new(trace)));
    }

    /// Append an outbound message. No-op if the trace is unknown.
    pub async fn record_sent(
        &self,
        correlation_id: &str,
        target: &str,
        key: &str,
        payload: Value,
        interaction: Option<ServiceInteraction>,
    ) {
        self.record(
            correlation_id,
            MessageEvent {
                direction: MessageDirection::Sent,
                target: target.to_string(),
                key: key.to_string(),
                payload,
                interaction,
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Append an inbound message with its externally observed timestamp.
    /// No-op if the trace is unknown.
    pub async fn record_received(
        &self,
        correlation_id: &str,
        target: &str,
        key: &str,
        payload: Value,
        interaction: Option<ServiceInteraction>,
        event_timestamp: DateTime<Utc>,
    ) {
        self.record(
            correlation_id,
            MessageEvent {
                direction: MessageDirection::Received,
                target: target.to_string(),
                key: key.to_string(),
                payload,
                interaction,
                timestamp: event_timestamp,
            },
        )
        .await;
    }

    async fn record(&self, correlation_id: &str, event: MessageEvent) {
        let trace = {
            let traces = self.traces.read().await;
            match traces.get(correlation_id) {
                Some(trace) => trace.clone(),
                None => return,
            }
        };
        tracing::debug!(
            correlation_id,
            target = %event.target,
            key = %event.key,
            direction = ?event.direction,
            payload = %redact_text(&event.payload.to_string()),
            "message recorded"
        );
        trace.write().await.events.push(event);
    }

    /// Remove the trace from the active set and retain its summary.
    pub async fn complete_trace(&self, correlation_id: &str) -> Option<TraceSummary> {
        let trace = self.traces.write().await.remove(correlation_id)?;
        let trace = trace.read().await;

        let mut targets: Vec<&str> = trace.events.iter().map(|e| e.target.as_str()).collect();
        targets.sort_unstable();
        targets.dedup();

        let last_ts = trace
            .events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(trace.started_at);

        let summary = TraceSummary {
            correlation_id: trace.correlation_id.clone(),
            test_id: trace.test_id.clone(),
            message_count: trace.events.len(),
            distinct_targets: targets.len(),
            duration_ms: (last_ts - trace.started_at).num_milliseconds().max(0) as u64,
            completed_at: Utc::now(),
        };

        let mut completed = self.completed.write().await;
        if completed.len() >= MAX_COMPLETED_SUMMARIES {
            // Evict the oldest retained summary to stay bounded.
            if let Some(oldest) = completed
                .values()
                .min_by_key(|s| s.completed_at)
                .map(|s| s.correlation_id.clone())
            {
                completed.remove(&oldest);
            }
        }
        completed.insert(summary.correlation_id.clone(), summary.clone());

        Some(summary)
    }

    /// Summary of a completed trace, if still retained.
    pub async fn trace_summary(&self, correlation_id: &str) -> Option<TraceSummary> {
        self.completed.read().await.get(correlation_id).cloned()
    }

    /// Run the ordering, missing-response, and timing-gap checks over the
    /// trace's recorded messages. Empty for an unknown or empty trace.
    pub async fn analyze_flow(&self, correlation_id: &str) -> Vec<FlowIssue> {
        let trace = {
            let traces = self.traces.read().await;
            match traces.get(correlation_id) {
                Some(trace) => trace.clone(),
                None => return Vec::new(),
            }
        };
        let trace = trace.read().await;
        let events = &trace.events;
        let mut issues = Vec::new();

        // 1. Ordering: recorded later but timestamped earlier.
        for pair in events.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            if later.timestamp < earlier.timestamp {
                issues.push(FlowIssue {
                    kind: FlowIssueKind::Ordering,
                    description: format!(
                        "message '{}' was recorded after '{}' but carries an earlier timestamp",
                        later.key, earlier.key
                    ),
                    detail: HashMap::from([
                        ("earlier_key".to_string(), json!(earlier.key)),
                        ("later_key".to_string(), json!(later.key)),
                        ("earlier_timestamp".to_string(), json!(earlier.timestamp)),
                        ("later_timestamp".to_string(), json!(later.timestamp)),
                    ]),
                });
            }
        }

        // 2. Missing response: one outstanding message is tolerated for async slack.
        let sent = events
            .iter()
            .filter(|e| e.direction == MessageDirection::Sent)
            .count();
        let received = events
            .iter()
            .filter(|e| e.direction == MessageDirection::Received)
            .count();
        if sent > received + 1 {
            issues.push(FlowIssue {
                kind: FlowIssueKind::MissingResponse,
                description: format!(
                    "{} messages sent but only {} responses received",
                    sent, received
                ),
                detail: HashMap::from([
                    ("sent_count".to_string(), json!(sent)),
                    ("received_count".to_string(), json!(received)),
                ]),
            });
        }

        // 3. Timing gap between adjacent messages.
        let threshold_ms = self.gap_threshold.as_millis() as i64;
        for pair in events.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            let gap_ms = (later.timestamp - earlier.timestamp).num_milliseconds();
            if gap_ms > threshold_ms {
                issues.push(FlowIssue {
                    kind: FlowIssueKind::TimingGap,
                    description: format!(
                        "{} ms gap between '{}' and '{}'",
                        gap_ms, earlier.target, later.target
                    ),
                    detail: HashMap::from([
                        ("gap_ms".to_string(), json!(gap_ms)),
                        ("from_target".to_string(), json!(earlier.target)),
                        ("to_target".to_string(), json!(later.target)),
                    ]),
                });
            }
        }

        issues
    }

    /// Evict active traces older than `max_age`. Returns the count evicted.
    /// Safe to call while recording continues on other traces.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(365));

        let mut stale = Vec::new();
        {
            let traces = self.traces.read().await;
            for (id, trace) in traces.iter() {
                if trace.read().await.started_at < cutoff {
                    stale.push(id.clone());
                }
            }
        }

        let mut traces = self.traces.write().await;
        let mut evicted = 0;
        for id in stale {
            // A trace scanned as stale may have been replaced by a fresh
            // start_trace in the meantime; re-check before removing.
            let still_stale = match traces.get(&id) {
                Some(trace) => trace.read().await.started_at < cutoff,
                None => false,
            };
            if still_stale && traces.remove(&id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn tracker_with_trace(correlation_id: &str) -> CorrelationTracker {
        let tracker = CorrelationTracker::new();
        tracker
            .start_trace(correlation_id, "test-1", "checkout flow")
            .await;
        tracker
    }

    #[tokio::test]
    async fn summary_counts_all_recorded_messages() {
        let tracker = tracker_with_trace("corr-1").await;
        for i in 0..4 {
            tracker
                .record_sent("corr-1", "orders.in", &format!("msg-{}", i), json!({}), None)
                .await;
        }
        for i in 0..3 {
            tracker
                .record_received(
                    "corr-1",
                    "orders.out",
                    &format!("reply-{}", i),
                    json!({}),
                    None,
                    Utc::now(),
                )
                .await;
        }

        let summary = tracker.complete_trace("corr-1").await.unwrap();
        assert_eq!(summary.message_count, 7);
        assert_eq!(summary.distinct_targets, 2);

        // Retained after completion.
        let retained = tracker.trace_summary("corr-1").await.unwrap();
        assert_eq!(retained.message_count, 7);
    }

    #[tokio::test]
    async fn recording_on_unknown_trace_is_a_no_op() {
        let tracker = CorrelationTracker::new();
        tracker
            .record_sent("ghost", "orders.in", "msg", json!({}), None)
            .await;
        assert!(tracker.complete_trace("ghost").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_start_trace_replaces_existing() {
        let tracker = tracker_with_trace("corr-1").await;
        tracker
            .record_sent("corr-1", "orders.in", "old", json!({}), None)
            .await;

        tracker.start_trace("corr-1", "test-2", "restarted").await;
        let summary = tracker.complete_trace("corr-1").await.unwrap();
        assert_eq!(summary.message_count, 0);
        assert_eq!(summary.test_id, "test-2");
    }

    #[tokio::test]
    async fn ordering_issue_flagged_for_backdated_second_event() {
        let tracker = tracker_with_trace("corr-1").await;
        tracker
            .record_received("corr-1", "a", "first", json!({}), None, Utc::now())
            .await;
        tracker
            .record_received(
                "corr-1",
                "b",
                "second",
                json!({}),
                None,
                Utc::now() - chrono::Duration::seconds(30),
            )
            .await;

        let issues = tracker.analyze_flow("corr-1").await;
        assert!(issues.iter().any(|i| i.kind == FlowIssueKind::Ordering));
    }

    #[tokio::test]
    async fn missing_response_needs_more_than_one_outstanding() {
        let tracker = tracker_with_trace("balanced").await;
        for i in 0..3 {
            tracker
                .record_sent("balanced", "svc", &format!("s{}", i), json!({}), None)
                .await;
            tracker
                .record_received(
                    "balanced",
                    "svc",
                    &format!("r{}", i),
                    json!({}),
                    None,
                    Utc::now(),
                )
                .await;
        }
        assert!(tracker.analyze_flow("balanced").await.is_empty());

        let tracker = tracker_with_trace("lossy").await;
        for i in 0..5 {
            tracker
                .record_sent("lossy", "svc", &format!("s{}", i), json!({}), None)
                .await;
        }
        tracker
            .record_received("lossy", "svc", "r0", json!({}), None, Utc::now())
            .await;

        let issues = tracker.analyze_flow("lossy").await;
        assert!(issues
            .iter()
            .any(|i| i.kind == FlowIssueKind::MissingResponse));
    }

    #[tokio::test]
    async fn timing_gap_uses_configured_threshold() {
        let tracker = CorrelationTracker::with_gap_threshold(Duration::from_secs(10));
        tracker.start_trace("corr-1", "test-1", "slow flow").await;
        let base = Utc::now() - chrono::Duration::seconds(60);
        tracker
            .record_received("corr-1", "a", "m1", json!({}), None, base)
            .await;
        tracker
            .record_received(
                "corr-1",
                "b",
                "m2",
                json!({}),
                None,
                base + chrono::Duration::seconds(30),
            )
            .await;

        let issues = tracker.analyze_flow("corr-1").await;
        let gap = issues
            .iter()
            .find(|i| i.kind == FlowIssueKind::TimingGap)
            .expect("timing gap issue");
        assert!(gap.description.contains("'a'") && gap.description.contains("'b'"));
    }

    #[tokio::test]
    async fn analyze_unknown_trace_is_empty() {
        let tracker = CorrelationTracker::new();
        assert!(tracker.analyze_flow("ghost").await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_evicts_only_stale_traces() {
        let tracker = CorrelationTracker::new();
        tracker.start_trace("old", "t", "").await;
        // Backdate the first trace past the cutoff.
        {
            let traces = tracker.traces.read().await;
            let trace = traces.get("old").unwrap().clone();
            drop(traces);
            trace.write().await.started_at = Utc::now() - chrono::Duration::hours(2);
        }
        tracker.start_trace("fresh", "t", "").await;

        let evicted = tracker.cleanup_older_than(Duration::from_secs(3600)).await;
        assert_eq!(evicted, 1);
        assert!(tracker.complete_trace("fresh").await.is_some());
        assert!(tracker.complete_trace("old").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_spares_a_stale_id_replaced_by_a_fresh_trace() {
        let tracker = CorrelationTracker::new();
        tracker.start_trace("corr-1", "t", "").await;
        {
            let traces = tracker.traces.read().await;
            let trace = traces.get("corr-1").unwrap().clone();
            drop(traces);
            trace.write().await.started_at = Utc::now() - chrono::Duration::hours(2);
        }
        // Re-starting under the same ID resets the clock; eviction must go
        // by the current trace's start time, not the scan's.
        tracker.start_trace("corr-1", "t2", "restarted").await;

        let evicted = tracker.cleanup_older_than(Duration::from_secs(3600)).await;
        assert_eq!(evicted, 0);
        let summary = tracker.complete_trace("corr-1").await.expect("trace kept");
        assert_eq!(summary.test_id, "t2");
    }
}
