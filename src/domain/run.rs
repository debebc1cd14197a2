//! Run results and reconstruction from the journal.
//!
//! A `PipelineRun` is the immutable result of one pipeline execution and is
//! what the change publisher consumes. A `RunRecord` is the view of the latest
//! run rebuilt from journal events (for `status` and resume).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::diff::RepoDiff;
use super::events::{Event, EventType, StepStatus};

/// What a run upgrades: a repository tag plus a target version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub tag: String,
    pub version: String,
}

impl Subject {
    pub fn new(tag: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            version: version.into(),
        }
    }

    /// Filesystem- and ref-safe identifier, e.g. `zksync-os-server-v31.0`
    pub fn slug(&self) -> String {
        let raw = format!("{}-{}", self.tag, self.version);
        let mut slug = String::with_capacity(raw.len());
        for c in raw.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                slug.push(c);
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        slug.trim_matches('-').to_string()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tag, self.version)
    }
}

/// Why a step halted the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureCause {
    /// The step's own action failed
    StepExecution {
        message: String,
        exit_code: Option<i32>,
        retryable: bool,
    },

    /// The step tried to mutate a path outside its repository's touched paths
    ScopeViolation { repository: String, path: String },

    /// The run was interrupted from outside
    Cancelled,
}

impl FailureCause {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Only execution failures flagged by the step may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepExecution { retryable: true, .. })
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepExecution { message, .. } => write!(f, "{}", message),
            Self::ScopeViolation { repository, path } => write!(
                f,
                "scope violation: '{}' is outside the touched paths of repository '{}'",
                path, repository
            ),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal status of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Every step reached ok
    Succeeded,

    /// Halted at `step`; `idempotent` echoes the step's declaration
    FailedAtStep {
        step: String,
        cause: FailureCause,
        idempotent: bool,
    },
}

/// Result of one pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_name: String,
    pub subject: Subject,
    pub status: RunStatus,

    /// Step names that finished, in execution order
    pub completed_steps: Vec<String>,

    /// Repository id -> scoped diff (empty if nothing changed)
    pub diffs: BTreeMap<String, RepoDiff>,

    /// Where step output was captured
    pub logs_dir: PathBuf,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            &self.status,
            RunStatus::FailedAtStep { cause, .. } if cause.is_cancelled()
        )
    }

    /// Name of the step the run halted at
    pub fn failed_step(&self) -> Option<&str> {
        match &self.status {
            RunStatus::Succeeded => None,
            RunStatus::FailedAtStep { step, .. } => Some(step),
        }
    }

    /// Process exit code for the front end: 0 ok, 130 cancelled, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match &self.status {
            RunStatus::Succeeded => 0,
            RunStatus::FailedAtStep { cause, .. } if cause.is_cancelled() => 130,
            RunStatus::FailedAtStep { .. } => 1,
        }
    }

    /// Human-readable failure report, sufficient to resume manually
    pub fn failure_report(&self) -> Option<String> {
        let RunStatus::FailedAtStep {
            step,
            cause,
            idempotent,
        } = &self.status
        else {
            return None;
        };

        let completed = if self.completed_steps.is_empty() {
            "(none)".to_string()
        } else {
            self.completed_steps.join(", ")
        };

        Some(format!(
            "Step '{}' failed: {}\n  Idempotent: {}\n  Completed steps: {}\n  Logs: {}",
            step,
            cause,
            if *idempotent { "yes" } else { "no" },
            completed,
            self.logs_dir.display()
        ))
    }
}

/// State of a run reconstructed from the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    Running,
    Completed,
    Failed { step: Option<String>, error: String },
    Cancelled { step: Option<String> },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

/// The latest run of a workspace, rebuilt from journal events
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: Uuid,
    pub pipeline_name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Repository id -> baseline revision captured at run start
    pub baselines: BTreeMap<String, String>,

    /// Steps in the order they were first seen, with their last status
    pub steps: Vec<(String, StepStatus)>,

    /// Publish outcomes recorded for this run
    pub published: Vec<String>,
}

impl RunRecord {
    /// Reconstruct the last run in the journal; earlier runs are ignored.
    /// A resumed run writes the inherited baselines into its own
    /// `run_started` event.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let start = events
            .iter()
            .rposition(|e| e.event_type == EventType::RunStarted)?;
        let first = &events[start];

        let mut record = Self {
            id: first.run_id,
            pipeline_name: String::new(),
            state: RunState::Running,
            started_at: first.timestamp,
            completed_at: None,
            baselines: BTreeMap::new(),
            steps: Vec::new(),
            published: Vec::new(),
        };

        for event in events[start..].iter().filter(|e| e.run_id == first.run_id) {
            record.apply_event(event);
        }

        Some(record)
    }

    /// Apply a single event to update the record
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(data) = &event.data {
                    if let Some(name) = data.get("pipeline").and_then(|v| v.as_str()) {
                        self.pipeline_name = name.to_string();
                    }
                    if let Some(baselines) = data.get("baselines") {
                        if let Ok(parsed) =
                            serde_json::from_value::<BTreeMap<String, String>>(baselines.clone())
                        {
                            self.baselines = parsed;
                        }
                    }
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    step: event.step.clone(),
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled {
                    step: event.step.clone(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted | EventType::StepRetrying => {
                self.set_step(event, StepStatus::Running);
            }
            EventType::StepCompleted => self.set_step(event, StepStatus::Completed),
            EventType::StepFailed => self.set_step(event, StepStatus::Failed),
            EventType::StepSkipped => self.set_step(event, StepStatus::Skipped),
            EventType::Published => self.published.push(event.summary.clone()),
        }
    }

    fn set_step(&mut self, event: &Event, status: StepStatus) {
        let Some(name) = &event.step else {
            return;
        };
        match self.steps.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = status,
            None => self.steps.push((name.clone(), status)),
        }
    }

    /// Steps that are done: completed in this run or carried over by a skip
    pub fn completed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, s)| matches!(s, StepStatus::Completed | StepStatus::Skipped))
            .map(|(n, _)| n.clone())
            .collect()
    }
}
