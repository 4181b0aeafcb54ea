//! # Pipeline Events
//!
//! Observer-facing events emitted by the coordinator. These are a progress
//! feed only; the message bus remains the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    PipelineStarted,
    PipelineResumed,
    /// Template, compensating or reconciled task created
    TaskCreated,
    WorkerSpawned,
    WorkerFinished,
    TaskCompleted,
    TaskBlocked,
    TaskFailed,
    TaskUnblocked,
    RetryScheduled,
    Escalated,
    GateEvaluated,
    GapClosureStarted,
    /// Fix-Verify cap reached, work accepted degraded
    GapClosureExhausted,
    DiscussionNeeded,
    PhaseChanged,
    /// Orphaned in-progress task found on resume
    OrphanRecovered,
    Paused,
    Aborted,
    PipelineCompleted,
    /// Nothing ready, nothing running, work left unresolved
    PipelineStalled,
    SessionArchived,
}

/// An event in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    pub session_id: String,
    /// Role or component that produced the event
    pub source: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind, session_id: &str, source: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            session_id: session_id.to_string(),
            source: source.to_string(),
            task_id: None,
            data: None,
        }
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::new(PipelineEventKind::WorkerSpawned, "s1", "executor")
            .with_task("impl-001")
            .with_data(serde_json::json!({"mode": "async"}));

        assert_eq!(event.source, "executor");
        assert_eq!(event.task_id.as_deref(), Some("impl-001"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "worker_spawned");
    }
}
