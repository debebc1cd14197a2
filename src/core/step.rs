//! Execution of a single pipeline step.
//!
//! File operations are resolved and scope-checked as a batch before the
//! first one runs, so a step that would write outside its touched paths
//! fails without modifying anything. External processes cannot be
//! intercepted that way; their effects are bounded by the scoped diff.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, error, warn};

use crate::adapters::{download, run_logged, DownloadOutcome, Invocation, ProcessError};
use crate::domain::FailureCause;

use super::expand::Expander;
use super::pipeline::{FileOp, Location, ProcessStep, Step, StepAction};
use super::repository::RepositorySet;
use super::scope::normalize_relative;
use super::workspace::Workspace;

/// Result of executing a step once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Completed, with an optional note for the run log
    Ok(Option<String>),
    Failed(FailureCause),
}

/// Everything a step may read while it runs
pub struct StepContext<'a> {
    pub workspace: &'a Workspace,
    pub repositories: &'a RepositorySet,
    pub params: &'a BTreeMap<String, String>,
    /// Position of the step in the pipeline (names its log file)
    pub index: usize,
    /// Pipeline-wide process timeout in seconds
    pub default_timeout: Option<u64>,
}

impl StepContext<'_> {
    fn expander(&self) -> Expander<'_> {
        Expander {
            workspace: self.workspace.root(),
            repositories: self.repositories,
            params: self.params,
        }
    }

    fn expand(&self, template: &str) -> Result<String, FailureCause> {
        self.expander().expand(template).map_err(|e| fatal(e.to_string()))
    }

    fn resolve_write(&self, location: &Location) -> Result<PathBuf, FailureCause> {
        match location {
            Location::Repo { repo, path } => {
                let handle = self
                    .repositories
                    .get(repo)
                    .ok_or_else(|| fatal(format!("Unknown repository '{}'", repo)))?;
                let path = self.expand(path)?;
                handle
                    .resolve_write(Path::new(&path))
                    .map_err(|v| FailureCause::ScopeViolation {
                        repository: v.repository,
                        path: v.path,
                    })
            }
            Location::Workspace { workspace } => self.workspace_path(workspace),
            Location::External { external } => Err(fatal(format!(
                "External location '{}' is read-only",
                external
            ))),
        }
    }

    fn resolve_read(&self, location: &Location) -> Result<PathBuf, FailureCause> {
        match location {
            Location::Repo { repo, path } => {
                let handle = self
                    .repositories
                    .get(repo)
                    .ok_or_else(|| fatal(format!("Unknown repository '{}'", repo)))?;
                let path = self.expand(path)?;
                handle.resolve_read(Path::new(&path)).ok_or_else(|| {
                    fatal(format!("Path '{}' escapes repository '{}'", path, repo))
                })
            }
            Location::Workspace { workspace } => self.workspace_path(workspace),
            Location::External { external } => Ok(PathBuf::from(self.expand(external)?)),
        }
    }

    fn workspace_path(&self, template: &str) -> Result<PathBuf, FailureCause> {
        let path = self.expand(template)?;
        let relative = Path::new(&path);
        let relative = relative
            .strip_prefix(self.workspace.root())
            .unwrap_or(relative);
        normalize_relative(relative)
            .map(|p| self.workspace.path(p))
            .ok_or_else(|| fatal(format!("Path '{}' escapes the workspace", path)))
    }
}

/// Run `step` once
pub async fn execute(step: &Step, ctx: &StepContext<'_>) -> StepOutcome {
    let result = match &step.action {
        StepAction::Noop => Ok(None),
        StepAction::Files { operations } => run_files(operations, ctx).await,
        StepAction::Process(process) => run_process(step, process, ctx).await,
    };

    match result {
        Ok(note) => StepOutcome::Ok(note),
        Err(cause) => StepOutcome::Failed(cause),
    }
}

enum Resolved {
    Copy { from: PathBuf, to: PathBuf },
    Write { to: PathBuf, contents: String },
    Replace { target: PathBuf, find: String, replace: String },
    Remove { target: PathBuf },
    Download { url: String, to: PathBuf, sha256: Option<String> },
}

fn resolve(op: &FileOp, ctx: &StepContext<'_>) -> Result<Resolved, FailureCause> {
    Ok(match op {
        FileOp::Copy { from, to } => Resolved::Copy {
            from: ctx.resolve_read(from)?,
            to: ctx.resolve_write(to)?,
        },
        FileOp::Write { to, contents } => Resolved::Write {
            to: ctx.resolve_write(to)?,
            contents: ctx.expand(contents)?,
        },
        FileOp::Replace {
            target,
            find,
            replace,
        } => Resolved::Replace {
            target: ctx.resolve_write(target)?,
            find: ctx.expand(find)?,
            replace: ctx.expand(replace)?,
        },
        FileOp::Remove { target } => Resolved::Remove {
            target: ctx.resolve_write(target)?,
        },
        FileOp::Download { url, to, sha256 } => Resolved::Download {
            url: ctx.expand(url)?,
            to: ctx.resolve_write(to)?,
            sha256: sha256.clone(),
        },
    })
}

async fn run_files(operations: &[FileOp], ctx: &StepContext<'_>) -> Result<Option<String>, FailureCause> {
    let resolved = operations
        .iter()
        .map(|op| resolve(op, ctx))
        .collect::<Result<Vec<_>, _>>()?;

    for op in &resolved {
        apply(op).await?;
    }

    Ok(Some(format!("{} file operation(s)", resolved.len())))
}

async fn apply(op: &Resolved) -> Result<(), FailureCause> {
    match op {
        Resolved::Copy { from, to } => {
            if !from.is_file() {
                return Err(fatal(format!("Copy source does not exist: {}", from.display())));
            }
            ensure_parent(to).await?;
            fs::copy(from, to).await.map_err(|e| {
                fatal(format!(
                    "Failed to copy {} to {}: {}",
                    from.display(),
                    to.display(),
                    e
                ))
            })?;
            debug!(from = %from.display(), to = %to.display(), "Copied");
        }
        Resolved::Write { to, contents } => {
            ensure_parent(to).await?;
            fs::write(to, contents)
                .await
                .map_err(|e| fatal(format!("Failed to write {}: {}", to.display(), e)))?;
            debug!(path = %to.display(), "Written");
        }
        Resolved::Replace {
            target,
            find,
            replace,
        } => {
            let content = fs::read_to_string(target)
                .await
                .map_err(|e| fatal(format!("Failed to read {}: {}", target.display(), e)))?;
            if !content.contains(find.as_str()) {
                return Err(fatal(format!(
                    "Pattern '{}' not found in {}",
                    find,
                    target.display()
                )));
            }
            fs::write(target, content.replace(find.as_str(), replace))
                .await
                .map_err(|e| fatal(format!("Failed to write {}: {}", target.display(), e)))?;
            debug!(path = %target.display(), "Replaced");
        }
        Resolved::Remove { target } => {
            let result = match fs::symlink_metadata(target).await {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).await,
                Ok(_) => fs::remove_file(target).await,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
            result.map_err(|e| fatal(format!("Failed to remove {}: {}", target.display(), e)))?;
        }
        Resolved::Download { url, to, sha256 } => {
            match download(url, to, sha256.as_deref()).await {
                Ok(outcome @ DownloadOutcome::Fetched { .. }) => {
                    debug!(url = %url, sha256 = outcome.sha256(), "Downloaded");
                }
                Ok(outcome @ DownloadOutcome::AlreadyPresent { .. }) => {
                    debug!(path = %to.display(), sha256 = outcome.sha256(), "Already present");
                }
                Err(e) => {
                    return Err(FailureCause::StepExecution {
                        message: format!("{:#}", e),
                        exit_code: None,
                        retryable: true,
                    })
                }
            }
        }
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<(), FailureCause> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| fatal(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    Ok(())
}

async fn run_process(
    step: &Step,
    process: &ProcessStep,
    ctx: &StepContext<'_>,
) -> Result<Option<String>, FailureCause> {
    let cwd = match &process.cwd {
        Some(location) => ctx.resolve_read(location)?,
        None => ctx
            .repositories
            .primary()
            .map(|r| r.root().to_path_buf())
            .ok_or_else(|| fatal("No repository to run in".to_string()))?,
    };

    let env = process
        .env
        .iter()
        .map(|(k, v)| Ok((k.clone(), ctx.expand(v)?)))
        .collect::<Result<BTreeMap<_, _>, FailureCause>>()?;

    let invocation = Invocation {
        program: ctx.expand(&process.program)?,
        args: process
            .args
            .iter()
            .map(|a| ctx.expand(a))
            .collect::<Result<Vec<_>, _>>()?,
        cwd,
        env,
        timeout: step.timeout(ctx.default_timeout),
    };

    let mut log = ctx
        .workspace
        .step_log(ctx.index, &step.name)
        .map_err(|e| fatal(format!("{:#}", e)))?;

    let result = run_logged(&invocation, &mut log).await;
    if let Err(e) = log.flush() {
        warn!(step = %step.name, error = %e, "Failed to flush step log");
    }

    let failure = match result {
        Ok(status) => match status.code() {
            Some(0) if process.allowed_exit_codes.contains(&0) => return Ok(None),
            Some(code) if process.allowed_exit_codes.contains(&code) => {
                warn!(step = %step.name, code, "Process exited with an allowed non-zero code");
                return Ok(Some(format!("exit code {} (allowed)", code)));
            }
            code => FailureCause::StepExecution {
                message: format!("'{}' exited with {}", invocation.program, status),
                exit_code: code,
                retryable: process.retryable,
            },
        },
        Err(e @ (ProcessError::TimedOut { .. } | ProcessError::Io { .. })) => {
            FailureCause::StepExecution {
                message: e.to_string(),
                exit_code: None,
                retryable: process.retryable,
            }
        }
        Err(e) => fatal(e.to_string()),
    };

    error!(step = %step.name, log = %log.path().display(), "{}", failure);
    for line in log.tail() {
        error!(step = %step.name, "  {}", line);
    }

    Err(failure)
}

fn fatal(message: String) -> FailureCause {
    FailureCause::StepExecution {
        message,
        exit_code: None,
        retryable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::repository::RepositoryHandle;
    use crate::core::scope::TouchedPaths;
    use crate::core::workspace::WorkspaceMode;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        repo_root: PathBuf,
        workspace: Workspace,
        repositories: RepositorySet,
        params: BTreeMap<String, String>,
    }

    async fn fixture(globs: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let repo_root = temp.path().join("server");
        std::fs::create_dir_all(&repo_root).unwrap();
        let workspace = Workspace::acquire(temp.path().join("ws"), false, WorkspaceMode::Fresh)
            .await
            .unwrap();
        let repositories = RepositorySet::new(vec![RepositoryHandle::new(
            "server",
            &repo_root,
            TouchedPaths::new(globs).unwrap(),
        )]);
        let params = [("PROTOCOL_VERSION".to_string(), "v31.0".to_string())]
            .into_iter()
            .collect();

        Fixture {
            _temp: temp,
            repo_root,
            workspace,
            repositories,
            params,
        }
    }

    impl Fixture {
        fn ctx(&self) -> StepContext<'_> {
            StepContext {
                workspace: &self.workspace,
                repositories: &self.repositories,
                params: &self.params,
                index: 0,
                default_timeout: None,
            }
        }
    }

    #[tokio::test]
    async fn test_file_ops_in_scope() {
        let f = fixture(&["local-chains/**"]).await;
        std::fs::write(f.workspace.path("genesis.json"), "{\"version\": \"old\"}").unwrap();

        let step = Step::files(
            "copy genesis",
            vec![
                FileOp::Copy {
                    from: Location::workspace("genesis.json"),
                    to: Location::repo("server", "local-chains/{param.PROTOCOL_VERSION}/genesis.json"),
                },
                FileOp::Replace {
                    target: Location::repo("server", "local-chains/{param.PROTOCOL_VERSION}/genesis.json"),
                    find: "old".into(),
                    replace: "{param.PROTOCOL_VERSION}".into(),
                },
            ],
        );

        let outcome = execute(&step, &f.ctx()).await;
        assert!(matches!(outcome, StepOutcome::Ok(_)));

        let written =
            std::fs::read_to_string(f.repo_root.join("local-chains/v31.0/genesis.json")).unwrap();
        assert_eq!(written, "{\"version\": \"v31.0\"}");
    }

    #[tokio::test]
    async fn test_scope_violation_touches_nothing() {
        let f = fixture(&["local-chains/**"]).await;

        let step = Step::files(
            "stray write",
            vec![
                FileOp::Write {
                    to: Location::repo("server", "local-chains/ok.txt"),
                    contents: "fine".into(),
                },
                FileOp::Write {
                    to: Location::repo("server", "Cargo.toml"),
                    contents: "oops".into(),
                },
            ],
        );

        let outcome = execute(&step, &f.ctx()).await;
        assert_eq!(
            outcome,
            StepOutcome::Failed(FailureCause::ScopeViolation {
                repository: "server".into(),
                path: "Cargo.toml".into(),
            })
        );
        assert!(!f.repo_root.join("local-chains/ok.txt").exists());
        assert!(!f.repo_root.join("Cargo.toml").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_symlink_out_of_scope_is_refused() {
        let f = fixture(&["local-chains/**"]).await;
        std::fs::create_dir_all(f.repo_root.join("local-chains")).unwrap();
        std::fs::write(f.repo_root.join("Cargo.toml"), "[workspace]\n").unwrap();
        std::os::unix::fs::symlink("../Cargo.toml", f.repo_root.join("local-chains/x")).unwrap();

        let step = Step::files(
            "write through link",
            vec![FileOp::Write {
                to: Location::repo("server", "local-chains/x"),
                contents: "oops".into(),
            }],
        );

        let outcome = execute(&step, &f.ctx()).await;
        assert_eq!(
            outcome,
            StepOutcome::Failed(FailureCause::ScopeViolation {
                repository: "server".into(),
                path: "local-chains/x".into(),
            })
        );
        assert_eq!(
            std::fs::read_to_string(f.repo_root.join("Cargo.toml")).unwrap(),
            "[workspace]\n"
        );
    }

    #[tokio::test]
    async fn test_replace_requires_pattern() {
        let f = fixture(&["Cargo.toml"]).await;
        std::fs::write(f.repo_root.join("Cargo.toml"), "version = \"1\"").unwrap();

        let step = Step::files(
            "bump",
            vec![FileOp::Replace {
                target: Location::repo("server", "Cargo.toml"),
                find: "tag = \"v0\"".into(),
                replace: "tag = \"v1\"".into(),
            }],
        );

        assert!(matches!(
            execute(&step, &f.ctx()).await,
            StepOutcome::Failed(FailureCause::StepExecution { retryable: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let f = fixture(&["local-chains/**"]).await;
        std::fs::create_dir_all(f.repo_root.join("local-chains/v30")).unwrap();
        std::fs::write(f.repo_root.join("local-chains/v30/a.json"), "{}").unwrap();

        let step = Step::files(
            "clean",
            vec![FileOp::Remove {
                target: Location::repo("server", "local-chains/v30"),
            }],
        );

        assert!(matches!(execute(&step, &f.ctx()).await, StepOutcome::Ok(_)));
        assert!(!f.repo_root.join("local-chains/v30").exists());
        assert!(matches!(execute(&step, &f.ctx()).await, StepOutcome::Ok(_)));
    }

    #[tokio::test]
    async fn test_external_location_is_read_only() {
        let f = fixture(&["**"]).await;
        let step = Step::files(
            "write external",
            vec![FileOp::Write {
                to: Location::external("/tmp/protoctl-should-not-exist"),
                contents: "x".into(),
            }],
        );

        assert!(matches!(
            execute(&step, &f.ctx()).await,
            StepOutcome::Failed(FailureCause::StepExecution { .. })
        ));
    }

    #[tokio::test]
    async fn test_process_exit_codes() {
        let f = fixture(&[]).await;

        let ok = Step::process(
            "allowed",
            ProcessStep::new("sh")
                .args(["-c", "exit 3"])
                .allow_exit_codes(&[0, 3]),
        );
        assert_eq!(
            execute(&ok, &f.ctx()).await,
            StepOutcome::Ok(Some("exit code 3 (allowed)".into()))
        );

        let failing = Step::process(
            "failing",
            ProcessStep::new("sh").args(["-c", "echo broken >&2; exit 1"]),
        );
        match execute(&failing, &f.ctx()).await {
            StepOutcome::Failed(FailureCause::StepExecution { exit_code, .. }) => {
                assert_eq!(exit_code, Some(1))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_runs_in_primary_repo_with_expanded_args() {
        let f = fixture(&[]).await;
        let step = Step::process(
            "pwd",
            ProcessStep::new("sh")
                .args(["-c", "pwd > out.txt; echo {param.PROTOCOL_VERSION} >> out.txt"]),
        );

        assert_eq!(execute(&step, &f.ctx()).await, StepOutcome::Ok(None));
        let out = std::fs::read_to_string(f.repo_root.join("out.txt")).unwrap();
        assert!(out.contains("v31.0"));
    }
}
