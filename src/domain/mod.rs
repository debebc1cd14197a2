//! Domain types for the protoctl engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable journal records of run progress
//! - Run: Pipeline results and journal reconstruction
//! - Diff: Scoped working-tree changes of a repository

pub mod diff;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use diff::RepoDiff;
pub use events::{Event, EventType, StepStatus};
pub use run::{FailureCause, PipelineRun, RunRecord, RunState, RunStatus, Subject};
