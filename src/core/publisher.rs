//! Change publisher: turns a run's scoped diff into a patch artifact, a
//! direct commit, or a branch plus pull request.
//!
//! | commit_changes | open_pr   | mode           |
//! |----------------|-----------|----------------|
//! | false          | (ignored) | artifact-only  |
//! | true           | false     | direct-commit  |
//! | true           | true      | branch-and-pr  |
//!
//! Pushes are never forced and never retried. A failed pull request after a
//! successful push is reported with the branch name; the branch stays.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::adapters::{GitError, PullRequestApi, PullRequestRequest};
use crate::domain::{PipelineRun, RepoDiff, Subject};

use super::repository::RepositoryHandle;

/// Prefix of branches created for pull requests
pub const BRANCH_PREFIX: &str = "protoctl/";

/// How a successful run's changes leave the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
    ArtifactOnly,
    DirectCommit,
    BranchAndPr,
}

impl PublishMode {
    pub fn select(commit_changes: bool, open_pr: bool) -> Self {
        match (commit_changes, open_pr) {
            (false, _) => Self::ArtifactOnly,
            (true, false) => Self::DirectCommit,
            (true, true) => Self::BranchAndPr,
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ArtifactOnly => "artifact-only",
            Self::DirectCommit => "direct-commit",
            Self::BranchAndPr => "branch-and-pr",
        };
        write!(f, "{}", s)
    }
}

/// What publishing did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing inside the touched paths changed
    NoChanges,
    /// Patch written; history untouched
    Patch { path: PathBuf },
    /// Single commit pushed to the checked-out branch
    Committed { branch: String, commit: String },
    /// Branch pushed and pull request opened
    PullRequestOpened {
        branch: String,
        commit: String,
        url: String,
    },
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChanges => write!(f, "no changes"),
            Self::Patch { path } => write!(f, "patch written to {}", path.display()),
            Self::Committed { branch, commit } => {
                write!(f, "committed {} and pushed to {}", short(commit), branch)
            }
            Self::PullRequestOpened { branch, url, .. } => {
                write!(f, "pushed {} and opened {}", branch, url)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Repository '{0}' is on a detached HEAD; cannot push a direct commit")]
    DetachedHead(String),

    #[error("Branch '{0}' already exists; delete it or choose another subject")]
    BranchExists(String),

    #[error("Push of '{branch}' to '{remote}' was rejected: {message}")]
    PushRejected {
        remote: String,
        branch: String,
        message: String,
    },

    #[error("Branch '{branch}' was pushed but opening the pull request failed: {message}")]
    PullRequestFailed { branch: String, message: String },

    #[error("Failed to write patch {path}: {source}")]
    PatchWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

impl PublishError {
    /// Branch left pushed on the remote, if any
    pub fn pushed_branch(&self) -> Option<&str> {
        match self {
            Self::PullRequestFailed { branch, .. } => Some(branch),
            _ => None,
        }
    }
}

/// Publishes scoped diffs
pub struct ChangePublisher {
    pr_api: Box<dyn PullRequestApi>,
    remote: String,
    patch_dir: PathBuf,
}

impl ChangePublisher {
    pub fn new(
        pr_api: Box<dyn PullRequestApi>,
        remote: impl Into<String>,
        patch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pr_api,
            remote: remote.into(),
            patch_dir: patch_dir.into(),
        }
    }

    /// `<subject>-<repo>.patch`, with a `-failed` suffix for failed runs
    pub fn patch_path(&self, subject: &Subject, repository: &str, failed: bool) -> PathBuf {
        let suffix = if failed { "-failed" } else { "" };
        self.patch_dir
            .join(format!("{}-{}{}.patch", subject.slug(), repository, suffix))
    }

    /// Publish `diff` of `repo`. Failed runs always produce a patch artifact,
    /// whatever the flags say.
    #[instrument(skip_all, fields(repository = %repo.id(), run_id = %run.id))]
    pub async fn publish(
        &self,
        repo: &RepositoryHandle,
        diff: &RepoDiff,
        run: &PipelineRun,
        commit_changes: bool,
        open_pr: bool,
    ) -> Result<PublishOutcome, PublishError> {
        if diff.is_empty() {
            info!("No changes inside touched paths; nothing to publish");
            return Ok(PublishOutcome::NoChanges);
        }

        if !run.succeeded() {
            let path = self.write_patch(diff, &run.subject, true).await?;
            return Ok(PublishOutcome::Patch { path });
        }

        match PublishMode::select(commit_changes, open_pr) {
            PublishMode::ArtifactOnly => {
                let path = self.write_patch(diff, &run.subject, false).await?;
                Ok(PublishOutcome::Patch { path })
            }
            PublishMode::DirectCommit => self.direct_commit(repo, diff, run).await,
            PublishMode::BranchAndPr => self.branch_and_pr(repo, diff, run).await,
        }
    }

    /// Write the patch artifact for `diff`
    pub async fn write_patch(
        &self,
        diff: &RepoDiff,
        subject: &Subject,
        failed: bool,
    ) -> Result<PathBuf, PublishError> {
        let path = self.patch_path(subject, &diff.repository, failed);
        let write_err = |source| PublishError::PatchWrite {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.patch_dir).await.map_err(write_err)?;
        fs::write(&path, &diff.patch).await.map_err(write_err)?;

        info!(path = %path.display(), files = diff.files.len(), "Patch written");
        Ok(path)
    }

    async fn direct_commit(
        &self,
        repo: &RepositoryHandle,
        diff: &RepoDiff,
        run: &PipelineRun,
    ) -> Result<PublishOutcome, PublishError> {
        let branch = repo.git().current_branch().await?;
        if branch == "HEAD" {
            return Err(PublishError::DetachedHead(repo.id().to_string()));
        }

        let commit = repo.commit(&diff.files, &commit_message(run)).await?;
        self.push(repo, &branch, false).await?;

        info!(%branch, commit = %short(&commit), "Committed and pushed");
        Ok(PublishOutcome::Committed { branch, commit })
    }

    async fn branch_and_pr(
        &self,
        repo: &RepositoryHandle,
        diff: &RepoDiff,
        run: &PipelineRun,
    ) -> Result<PublishOutcome, PublishError> {
        let git = repo.git();
        let base = git.current_branch().await?;
        let branch = branch_name(&run.subject);

        if git.branch_exists(&branch).await? {
            return Err(PublishError::BranchExists(branch));
        }

        repo.create_branch(&branch).await?;
        let commit = repo.commit(&diff.files, &commit_message(run)).await?;
        self.push(repo, &branch, true).await?;
        info!(%branch, commit = %short(&commit), "Branch pushed");

        let request = PullRequestRequest {
            repo_root: repo.root().to_path_buf(),
            base,
            head: branch.clone(),
            title: pr_title(&run.subject),
            body: pr_body(run, diff),
        };

        match self.pr_api.create(&request).await {
            Ok(pr) => {
                info!(url = %pr.url, backend = self.pr_api.name(), "Pull request opened");
                Ok(PublishOutcome::PullRequestOpened {
                    branch,
                    commit,
                    url: pr.url,
                })
            }
            Err(e) => {
                warn!(%branch, error = %e, "Pull request creation failed; branch remains pushed");
                Err(PublishError::PullRequestFailed {
                    branch,
                    message: format!("{:#}", e),
                })
            }
        }
    }

    async fn push(
        &self,
        repo: &RepositoryHandle,
        branch: &str,
        set_upstream: bool,
    ) -> Result<(), PublishError> {
        repo.push(&self.remote, branch, set_upstream)
            .await
            .map_err(|e| match e {
                GitError::Failed { stderr, .. } => PublishError::PushRejected {
                    remote: self.remote.clone(),
                    branch: branch.to_string(),
                    message: stderr,
                },
                other => PublishError::Git(other),
            })
    }
}

/// Branch created for a subject's pull request
pub fn branch_name(subject: &Subject) -> String {
    format!("{}{}", BRANCH_PREFIX, subject.slug())
}

pub fn pr_title(subject: &Subject) -> String {
    format!("Update {} to {}", subject.tag, subject.version)
}

/// Commit message describing the upgrade
pub fn commit_message(run: &PipelineRun) -> String {
    let mut message = format!(
        "{}\n\nGenerated by pipeline '{}'.\n\nSteps:\n",
        pr_title(&run.subject),
        run.pipeline_name
    );
    for step in &run.completed_steps {
        message.push_str(&format!("- {}\n", step));
    }
    message
}

/// Pull request description: subject, steps, changed files
pub fn pr_body(run: &PipelineRun, diff: &RepoDiff) -> String {
    let mut body = format!(
        "Automated update of `{}` to `{}` by pipeline `{}`.\n\n### Completed steps\n\n",
        run.subject.tag, run.subject.version, run.pipeline_name
    );
    for (i, step) in run.completed_steps.iter().enumerate() {
        body.push_str(&format!("{}. {}\n", i + 1, step));
    }
    body.push_str("\n### Changed files\n\n");
    for file in &diff.files {
        body.push_str(&format!("- `{}`\n", file));
    }
    body
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn run() -> PipelineRun {
        PipelineRun {
            id: Uuid::new_v4(),
            pipeline_name: "update-protocol".into(),
            subject: Subject::new("zksync-os-server", "v31.0"),
            status: RunStatus::Succeeded,
            completed_steps: vec!["build".into(), "generate".into()],
            diffs: BTreeMap::new(),
            logs_dir: PathBuf::from("/ws/.logs"),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_mode_truth_table() {
        assert_eq!(PublishMode::select(false, false), PublishMode::ArtifactOnly);
        assert_eq!(PublishMode::select(false, true), PublishMode::ArtifactOnly);
        assert_eq!(PublishMode::select(true, false), PublishMode::DirectCommit);
        assert_eq!(PublishMode::select(true, true), PublishMode::BranchAndPr);
        assert_eq!(PublishMode::BranchAndPr.to_string(), "branch-and-pr");
    }

    #[test]
    fn test_generated_text() {
        let run = run();
        assert_eq!(branch_name(&run.subject), "protoctl/zksync-os-server-v31.0");

        let message = commit_message(&run);
        assert!(message.starts_with("Update zksync-os-server to v31.0\n"));
        assert!(message.contains("- build\n- generate\n"));

        let diff = RepoDiff {
            repository: "server".into(),
            files: vec!["local-chains/v31.0/genesis.json".into()],
            ..Default::default()
        };
        let body = pr_body(&run, &diff);
        assert!(body.contains("1. build\n2. generate\n"));
        assert!(body.contains("- `local-chains/v31.0/genesis.json`"));
    }
}
