//! Pull request creation.
//!
//! The publisher only needs "open a PR for this pushed branch"; the default
//! implementation shells out to the GitHub CLI (`gh`), which picks up the
//! token from `GH_TOKEN`/`GITHUB_TOKEN` the same way CI jobs already do.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// What to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRequest {
    /// Checkout the branch was pushed from
    pub repo_root: PathBuf,
    /// Branch to merge into
    pub base: String,
    /// Pushed branch
    pub head: String,
    pub title: String,
    pub body: String,
}

/// An opened pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub url: String,
}

/// Trait for pull request backends
#[async_trait]
pub trait PullRequestApi: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Open a pull request for an already pushed branch
    async fn create(&self, request: &PullRequestRequest) -> Result<PullRequest>;
}

/// `gh pr create` backend
pub struct GhCli {
    binary_path: String,
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GhCli {
    pub fn new() -> Self {
        Self::with_binary_path("gh")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl PullRequestApi for GhCli {
    fn name(&self) -> &str {
        "gh"
    }

    async fn create(&self, request: &PullRequestRequest) -> Result<PullRequest> {
        let output = Command::new(&self.binary_path)
            .args([
                "pr",
                "create",
                "--base",
                &request.base,
                "--head",
                &request.head,
                "--title",
                &request.title,
                "--body",
                &request.body,
            ])
            .current_dir(&request.repo_root)
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "gh pr create failed with exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("gh output is not valid UTF-8")?;
        let url = stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .unwrap_or(stdout.trim())
            .trim()
            .to_string();

        Ok(PullRequest { url })
    }
}
