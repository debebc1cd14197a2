//! Thin async wrapper around the `git` CLI.

use std::path::PathBuf;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args} failed with exit code {code}: {stderr}")]
    Failed {
        args: String,
        code: i32,
        stderr: String,
    },
}

/// Git commands rooted at one checkout
#[derive(Debug, Clone)]
pub struct Git {
    root: PathBuf,
    index_file: Option<PathBuf>,
}

impl Git {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_file: None,
        }
    }

    /// Use an alternate index file, leaving the checkout's real index alone
    pub fn with_index_file(mut self, index_file: impl Into<PathBuf>) -> Self {
        self.index_file = Some(index_file.into());
        self
    }

    /// Run git and return trimmed stdout; non-zero exit is an error
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Run git and return stdout as raw bytes (patches may carry any encoding)
    pub async fn run_raw(&self, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Run git and report only whether it exited zero
    pub async fn succeeds(&self, args: &[&str]) -> Result<bool, GitError> {
        Ok(self.output(args).await?.status.success())
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output, GitError> {
        debug!(root = %self.root.display(), "git {}", args.join(" "));

        let mut command = Command::new("git");
        command
            .arg("--literal-pathspecs")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(index) = &self.index_file {
            command.env("GIT_INDEX_FILE", index);
        }

        Ok(command.output().await?)
    }

    pub async fn head(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{}", branch);
        self.succeeds(&["show-ref", "--verify", "--quiet", &reference])
            .await
    }
}
