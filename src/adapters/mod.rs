//! Adapters for external tools.
//!
//! Everything the engine does outside its own process goes through here:
//! - `process`: logged subprocess execution for external-process steps
//! - `git`: plumbing for baselines, diffs, commits and pushes
//! - `github`: pull request creation (behind the `PullRequestApi` trait)
//! - `download`: streamed, checksummed artifact downloads

pub mod download;
pub mod git;
pub mod github;
pub mod process;

pub use download::{download, DownloadOutcome};
pub use git::{Git, GitError};
pub use github::{GhCli, PullRequest, PullRequestApi, PullRequestRequest};
pub use process::{run_logged, Invocation, ProcessError};
