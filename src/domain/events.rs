//! Journal events for pipeline runs.
//!
//! Every state change of a run is recorded as an immutable event in the
//! workspace journal. The latest run can be reconstructed (and resumed) by
//! replaying its events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in the append-only journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Step name (if applicable)
    pub step: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured payload (baselines, publish outcome, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step,
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach a structured payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started; `data` carries the baseline revisions
    RunStarted,

    /// A run finished with every step ok
    RunCompleted,

    /// A run halted at a failing step
    RunFailed,

    /// A run was interrupted from outside
    RunCancelled,

    /// A step has started execution
    StepStarted,

    /// A step finished ok
    StepCompleted,

    /// A step failed
    StepFailed,

    /// A step failed with a retryable cause and will run again
    StepRetrying,

    /// A step was completed by a previous run and is not executed again
    StepSkipped,

    /// The change publisher acted on the run's diff
    Published,
}

/// Status of a step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Skipped on resume
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("build".to_string()),
            EventType::StepStarted,
            "Starting build",
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.step.as_deref(), Some("build"));
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_event_builders() {
        let event = Event::new(Uuid::new_v4(), None, EventType::StepFailed, "Failed")
            .with_duration(1500)
            .with_error("exit code 1")
            .with_data(serde_json::json!({ "exit_code": 1 }));

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("exit code 1"));
        assert_eq!(event.data.unwrap()["exit_code"], 1);
    }
}
