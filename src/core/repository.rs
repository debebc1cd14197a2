//! Repository handles: an externally managed checkout plus the paths a
//! pipeline may touch in it.
//!
//! The handle captures a baseline revision before any step runs and later
//! computes the diff of the working tree against it, restricted to the
//! touched paths. Diffs are computed through a throwaway index so the
//! checkout's own index and history are left alone.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::adapters::{Git, GitError};
use crate::domain::RepoDiff;

use super::scope::{normalize_relative, ScopeViolation, TouchedPaths};

/// A checked-out repository bound to one run
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
    id: String,
    root: PathBuf,
    touched: TouchedPaths,
    baseline: Option<String>,
}

impl RepositoryHandle {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>, touched: TouchedPaths) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            touched,
            baseline: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn touched_paths(&self) -> &TouchedPaths {
        &self.touched
    }

    pub fn baseline(&self) -> Option<&str> {
        self.baseline.as_deref()
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    /// Record the current HEAD as the diff base
    pub async fn capture_baseline(&mut self) -> Result<String> {
        let head = self.git().head().await.with_context(|| {
            format!(
                "Failed to read HEAD of repository '{}' at {}",
                self.id,
                self.root.display()
            )
        })?;
        debug!(repository = %self.id, baseline = %head, "Captured baseline");
        self.baseline = Some(head.clone());
        Ok(head)
    }

    /// Reuse a baseline recorded by an earlier run
    pub fn set_baseline(&mut self, revision: impl Into<String>) {
        self.baseline = Some(revision.into());
    }

    /// Resolve a write target; fails without touching the filesystem when
    /// the path is outside the touched paths.
    pub fn resolve_write(&self, path: &Path) -> Result<PathBuf, ScopeViolation> {
        let target = self.touched.check(&self.id, &self.root, path)?;
        self.touched.check_links(&self.id, &self.root, &target)?;
        Ok(target)
    }

    /// Resolve a read source inside the checkout (no scope restriction)
    pub fn resolve_read(&self, path: &Path) -> Option<PathBuf> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        normalize_relative(relative).map(|p| self.root.join(p))
    }

    /// Diff of the working tree against the baseline, limited to the
    /// touched paths. `scratch` holds the temporary index.
    pub async fn diff(&self, scratch: &Path) -> Result<RepoDiff> {
        let baseline = self
            .baseline
            .as_deref()
            .with_context(|| format!("No baseline captured for repository '{}'", self.id))?;

        let index = scratch.join(format!("{}.index", self.id));
        let git = Git::new(&self.root).with_index_file(&index);

        git.run(&["read-tree", baseline]).await?;
        git.run(&["add", "-A"]).await?;
        let names = git
            .run(&["diff", "--cached", "--name-only", "--no-renames", "-z", baseline])
            .await?;

        let (files, out_of_scope): (Vec<String>, Vec<String>) = names
            .split('\0')
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .partition(|n| self.touched.contains(Path::new(n)));

        if !out_of_scope.is_empty() {
            warn!(
                repository = %self.id,
                files = ?out_of_scope,
                "Changes outside touched paths are excluded from the diff"
            );
        }

        let patch = if files.is_empty() {
            Vec::new()
        } else {
            let mut args = vec!["diff", "--cached", "--binary", "--no-renames", baseline, "--"];
            args.extend(files.iter().map(String::as_str));
            git.run_raw(&args).await?
        };

        let _ = tokio::fs::remove_file(&index).await;

        Ok(RepoDiff {
            repository: self.id.clone(),
            baseline: baseline.to_string(),
            files,
            out_of_scope,
            patch,
        })
    }

    /// Stage exactly `files` and commit them; returns the new commit id
    pub async fn commit(&self, files: &[String], message: &str) -> Result<String, GitError> {
        let git = self.git();

        let mut add = vec!["add", "-A", "--"];
        add.extend(files.iter().map(String::as_str));
        git.run(&add).await?;

        let mut commit = vec!["commit", "-q", "-m", message, "--"];
        commit.extend(files.iter().map(String::as_str));
        git.run(&commit).await?;

        git.head().await
    }

    /// Create and switch to `branch` at the current HEAD, keeping the
    /// working tree as is
    pub async fn create_branch(&self, branch: &str) -> Result<(), GitError> {
        self.git().run(&["checkout", "-q", "-b", branch]).await.map(|_| ())
    }

    /// Push HEAD to `remote` as `branch`; never forces
    pub async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<(), GitError> {
        let refspec = format!("HEAD:refs/heads/{}", branch);
        let mut args = vec!["push", "-q"];
        if set_upstream {
            args.push("-u");
        }
        args.push(remote);
        args.push(&refspec);
        self.git().run(&args).await.map(|_| ())
    }
}

/// The repositories bound to a run, in declaration order
#[derive(Debug, Clone, Default)]
pub struct RepositorySet {
    handles: Vec<RepositoryHandle>,
}

impl RepositorySet {
    pub fn new(handles: Vec<RepositoryHandle>) -> Self {
        Self { handles }
    }

    pub fn get(&self, id: &str) -> Option<&RepositoryHandle> {
        self.handles.iter().find(|h| h.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RepositoryHandle> {
        self.handles.iter_mut().find(|h| h.id == id)
    }

    /// The first declared repository (default working directory)
    pub fn primary(&self) -> Option<&RepositoryHandle> {
        self.handles.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepositoryHandle> {
        self.handles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RepositoryHandle> {
        self.handles.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
