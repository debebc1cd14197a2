//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: recipe definitions and loading
//! - Step: execution of a single step against the workspace and repositories
//! - Workspace: scratch directory, log sink and journal location of one run
//! - Repository: handles with baselines, scoped diffs, commits and pushes
//! - Orchestrator: the fail-fast run loop
//! - Publisher: patch / direct commit / branch and pull request
//! - Toolchain: required programs and versions, checked before a run

pub mod cancel;
pub mod expand;
pub mod journal;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;
pub mod repository;
pub mod scope;
pub mod step;
pub mod toolchain;
pub mod workspace;

// Re-export commonly used types
pub use cancel::{cancellation, CancelHandle, Cancellation};
pub use journal::Journal;
pub use orchestrator::{Orchestrator, RunBinding};
pub use pipeline::{
    FileOp, Location, ParamSpec, Pipeline, ProcessStep, RepositorySpec, RetryPolicy, Step,
    StepAction,
};
pub use publisher::{ChangePublisher, PublishError, PublishMode, PublishOutcome};
pub use repository::{RepositoryHandle, RepositorySet};
pub use scope::{ScopeViolation, TouchedPaths};
pub use step::{StepContext, StepOutcome};
pub use toolchain::{preflight, ToolRequirement, ToolchainError};
pub use workspace::{Workspace, WorkspaceMode};
