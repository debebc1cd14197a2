//! protoctl - pipeline and repository-change engine for protocol upgrades
//!
//! Applies an ordered set of local file and process operations to one or
//! more checked-out repositories and reports the result as a scoped diff,
//! which is then left as a patch, committed directly, or pushed as a branch
//! with a pull request.
//!
//! # Architecture
//!
//! - Every run is journaled as immutable events in its workspace
//! - Steps run strictly in order and the first failure halts the run
//! - A failed run can be resumed, skipping the steps already completed
//! - Writes outside a repository's touched paths never reach the filesystem
//!
//! # Modules
//!
//! - `adapters`: external tools (processes, git, GitHub, downloads)
//! - `core`: pipeline, workspace, repositories, orchestrator, publisher
//! - `domain`: data structures (events, diffs, run results)
//! - `config`: engine configuration
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Produce a patch for the server repository
//! REPO_DIR=../zksync-os-server PROTOCOL_VERSION=v31.0 protoctl run update-protocol
//!
//! # Continue after fixing the failing step
//! protoctl run update-protocol --resume
//!
//! # Inspect the latest run
//! protoctl status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::{ConfigError, EngineConfig};
pub use core::{ChangePublisher, Orchestrator, Pipeline, PublishMode, PublishOutcome, Workspace};
pub use domain::{Event, EventType, FailureCause, PipelineRun, RepoDiff, RunStatus, Subject};
