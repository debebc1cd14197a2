//! Main orchestrator for pipeline execution.
//!
//! Runs steps strictly in order, fail-fast, journaling every transition.
//! Once the step loop ends (for any reason) the scoped diff of every
//! repository is computed against its baseline.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Event, EventType, FailureCause, PipelineRun, RunStatus, Subject};

use super::cancel::Cancellation;
use super::journal::Journal;
use super::pipeline::{Pipeline, Step};
use super::repository::RepositorySet;
use super::step::{self, StepContext, StepOutcome};
use super::toolchain::ToolRequirement;
use super::workspace::Workspace;

/// A pipeline bound to concrete values
#[derive(Debug, Clone)]
pub struct RunBinding {
    pub subject: Subject,
    pub params: BTreeMap<String, String>,
    pub repositories: RepositorySet,
    /// Checked by the tool preflight before a run starts
    pub tools: Vec<ToolRequirement>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    cancel: Cancellation,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// An orchestrator that is never cancelled
    pub fn new() -> Self {
        Self::with_cancellation(Cancellation::never())
    }

    pub fn with_cancellation(cancel: Cancellation) -> Self {
        Self { cancel }
    }

    /// Execute `pipeline` inside `workspace`. With `resume`, steps the
    /// previous run of this workspace completed are skipped and its
    /// baselines are reused.
    ///
    /// Step failures are part of the returned `PipelineRun`; `Err` is only
    /// returned when the engine itself cannot proceed (journal, baseline or
    /// diff I/O).
    #[instrument(skip_all, fields(pipeline = %pipeline.name, subject = %binding.subject))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        binding: &mut RunBinding,
        workspace: &Workspace,
        resume: bool,
    ) -> Result<PipelineRun> {
        let journal = Journal::new(workspace.journal_path());

        let previous = if resume {
            let record = journal
                .last_run()
                .await?
                .context("Workspace journal holds no run to resume")?;
            if record.pipeline_name != pipeline.name {
                anyhow::bail!(
                    "Cannot resume: workspace holds a run of '{}', not '{}'",
                    record.pipeline_name,
                    pipeline.name
                );
            }
            Some(record)
        } else {
            None
        };

        let mut baselines = BTreeMap::new();
        for repo in binding.repositories.iter_mut() {
            let inherited = previous
                .as_ref()
                .and_then(|r| r.baselines.get(repo.id()))
                .cloned();
            let baseline = match inherited {
                Some(rev) => {
                    repo.set_baseline(&rev);
                    rev
                }
                None => repo.capture_baseline().await?,
            };
            baselines.insert(repo.id().to_string(), baseline);
        }

        let done: HashSet<String> = previous
            .as_ref()
            .map(|r| r.completed_steps().into_iter().collect())
            .unwrap_or_default();

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, resume, "Starting pipeline execution");

        journal
            .append(
                &Event::new(
                    run_id,
                    None,
                    EventType::RunStarted,
                    format!("Pipeline '{}' started", pipeline.name),
                )
                .with_data(json!({
                    "pipeline": pipeline.name,
                    "subject": binding.subject,
                    "baselines": baselines,
                    "resume": resume,
                })),
            )
            .await?;
        workspace.log(&format!(
            "Pipeline '{}' ({}) started{}",
            pipeline.name,
            binding.subject,
            if resume { " (resumed)" } else { "" }
        ));

        let mut completed_steps = Vec::new();
        let mut status = RunStatus::Succeeded;
        let total = pipeline.steps.len();

        for (index, step) in pipeline.steps.iter().enumerate() {
            let header = format!("[{}/{}] {}", index + 1, total, step.name);

            if self.cancel.is_cancelled() {
                status = failed_at(step, FailureCause::Cancelled);
                break;
            }

            if done.contains(&step.name) {
                info!(step = %step.name, "Step already completed, skipping");
                workspace.log(&format!("{}: skipped (completed earlier)", header));
                journal
                    .append(&Event::new(
                        run_id,
                        Some(step.name.clone()),
                        EventType::StepSkipped,
                        format!("Step '{}' completed by a previous run", step.name),
                    ))
                    .await?;
                completed_steps.push(step.name.clone());
                continue;
            }

            workspace.log(&header);
            let ctx = StepContext {
                workspace,
                repositories: &binding.repositories,
                params: &binding.params,
                index,
                default_timeout: pipeline.step_timeout_seconds,
            };

            match self
                .execute_step_with_retry(&journal, run_id, pipeline, step, &ctx)
                .await?
            {
                StepOutcome::Ok(_) => completed_steps.push(step.name.clone()),
                StepOutcome::Failed(cause) => {
                    status = failed_at(step, cause);
                    break;
                }
            }
        }

        let terminal = match &status {
            RunStatus::Succeeded => {
                info!("Pipeline completed successfully");
                workspace.log("Pipeline succeeded");
                Event::new(
                    run_id,
                    None,
                    EventType::RunCompleted,
                    format!("Pipeline '{}' completed", pipeline.name),
                )
            }
            RunStatus::FailedAtStep { step, cause, .. } if cause.is_cancelled() => {
                warn!(step = %step, "Pipeline cancelled");
                workspace.log(&format!("Pipeline cancelled at step '{}'", step));
                Event::new(
                    run_id,
                    Some(step.clone()),
                    EventType::RunCancelled,
                    format!("Pipeline '{}' cancelled", pipeline.name),
                )
            }
            RunStatus::FailedAtStep { step, cause, .. } => {
                error!(step = %step, error = %cause, "Pipeline failed");
                workspace.log(&format!("Pipeline failed at step '{}': {}", step, cause));
                Event::new(
                    run_id,
                    Some(step.clone()),
                    EventType::RunFailed,
                    format!("Pipeline '{}' failed", pipeline.name),
                )
                .with_error(cause.to_string())
            }
        };
        journal.append(&terminal).await?;

        let scratch = workspace.scratch_dir()?;
        let mut diffs = BTreeMap::new();
        for repo in binding.repositories.iter() {
            let diff = repo
                .diff(scratch.path())
                .await
                .with_context(|| format!("Failed to compute diff of repository '{}'", repo.id()))?;
            debug!(repository = %repo.id(), files = diff.files.len(), "Computed diff");
            diffs.insert(repo.id().to_string(), diff);
        }

        Ok(PipelineRun {
            id: run_id,
            pipeline_name: pipeline.name.clone(),
            subject: binding.subject.clone(),
            status,
            completed_steps,
            diffs,
            logs_dir: workspace.logs_dir().to_path_buf(),
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Execute a step, retrying retryable failures per the pipeline policy
    async fn execute_step_with_retry(
        &self,
        journal: &Journal,
        run_id: Uuid,
        pipeline: &Pipeline,
        step: &Step,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutcome> {
        let policy = &pipeline.retry_policy;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let step_start = Instant::now();

            journal
                .append(&Event::new(
                    run_id,
                    Some(step.name.clone()),
                    EventType::StepStarted,
                    format!("Step '{}' attempt {}", step.name, attempt),
                ))
                .await?;
            info!(step = %step.name, attempt, "Executing step");

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => StepOutcome::Failed(FailureCause::Cancelled),
                outcome = step::execute(step, ctx) => outcome,
            };

            let duration_ms = step_start.elapsed().as_millis() as u64;

            match outcome {
                StepOutcome::Ok(note) => {
                    report_duration(step, duration_ms);
                    let summary = match &note {
                        Some(n) => format!("Step '{}' completed: {}", step.name, n),
                        None => format!("Step '{}' completed", step.name),
                    };
                    ctx.workspace.log(&format!(
                        "{}: ok ({:.1}s)",
                        step.name,
                        duration_ms as f64 / 1000.0
                    ));
                    journal
                        .append(
                            &Event::new(
                                run_id,
                                Some(step.name.clone()),
                                EventType::StepCompleted,
                                summary,
                            )
                            .with_duration(duration_ms),
                        )
                        .await?;
                    return Ok(StepOutcome::Ok(note));
                }

                StepOutcome::Failed(cause)
                    if cause.is_retryable() && policy.should_retry(attempt) =>
                {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        step = %step.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "Step failed, retrying"
                    );
                    journal
                        .append(
                            &Event::new(
                                run_id,
                                Some(step.name.clone()),
                                EventType::StepRetrying,
                                format!("Retrying step '{}' after attempt {}", step.name, attempt),
                            )
                            .with_duration(duration_ms)
                            .with_error(cause.to_string()),
                        )
                        .await?;

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return self
                                .record_failure(journal, run_id, step, FailureCause::Cancelled, duration_ms)
                                .await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                StepOutcome::Failed(cause) => {
                    ctx.workspace
                        .log(&format!("{}: FAILED: {}", step.name, cause));
                    return self
                        .record_failure(journal, run_id, step, cause, duration_ms)
                        .await;
                }
            }
        }
    }

    async fn record_failure(
        &self,
        journal: &Journal,
        run_id: Uuid,
        step: &Step,
        cause: FailureCause,
        duration_ms: u64,
    ) -> Result<StepOutcome> {
        journal
            .append(
                &Event::new(
                    run_id,
                    Some(step.name.clone()),
                    EventType::StepFailed,
                    format!("Step '{}' failed", step.name),
                )
                .with_duration(duration_ms)
                .with_error(cause.to_string()),
            )
            .await?;
        Ok(StepOutcome::Failed(cause))
    }
}

fn failed_at(step: &Step, cause: FailureCause) -> RunStatus {
    RunStatus::FailedAtStep {
        step: step.name.clone(),
        cause,
        idempotent: step.idempotent,
    }
}

fn report_duration(step: &Step, duration_ms: u64) {
    let actual = duration_ms as f64 / 1000.0;
    match step.expected_seconds {
        Some(expected) => info!(
            step = %step.name,
            actual_s = %format!("{:.1}", actual),
            expected_s = expected,
            delta_s = %format!("{:+.1}", actual - expected as f64),
            "Step completed"
        ),
        None => info!(step = %step.name, actual_s = %format!("{:.1}", actual), "Step completed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::{FileOp, Location, ProcessStep};
    use crate::core::repository::RepositoryHandle;
    use crate::core::scope::TouchedPaths;
    use crate::core::workspace::WorkspaceMode;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(root: &Path) {
        std::fs::create_dir_all(root).unwrap();
        git(root, &["init", "-q", "-b", "main"]);
        git(root, &["config", "user.email", "ci@example.com"]);
        git(root, &["config", "user.name", "CI"]);
        std::fs::write(root.join("README.md"), "server\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "init"]);
    }

    fn binding(root: &Path) -> RunBinding {
        RunBinding {
            subject: Subject::new("zksync-os-server", "v31.0"),
            params: BTreeMap::new(),
            repositories: RepositorySet::new(vec![RepositoryHandle::new(
                "server",
                root,
                TouchedPaths::new(&["local-chains/**"]).unwrap(),
            )]),
            tools: Vec::new(),
        }
    }

    fn pipeline(steps: Vec<Step>) -> Pipeline {
        let mut p = Pipeline::from_yaml(
            r#"
name: test
subject: { tag: zksync-os-server, version: v31.0 }
repositories:
  - id: server
    touched_paths: ["local-chains/**"]
steps:
  - name: placeholder
    action: { kind: noop }
"#,
        )
        .unwrap();
        p.steps = steps;
        p
    }

    fn write_step(name: &str, path: &str) -> Step {
        Step::files(
            name,
            vec![FileOp::Write {
                to: Location::repo("server", path),
                contents: format!("{}\n", name),
            }],
        )
        .idempotent()
    }

    #[tokio::test]
    async fn test_fail_fast_records_completed_steps() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("server");
        init_repo(&repo);
        let ws = Workspace::acquire(temp.path().join("ws"), false, WorkspaceMode::Fresh)
            .await
            .unwrap();

        let p = pipeline(vec![
            write_step("first", "local-chains/a.json"),
            Step::process("broken", ProcessStep::new("sh").args(["-c", "exit 2"])),
            write_step("never", "local-chains/b.json"),
        ]);

        let run = Orchestrator::new()
            .run(&p, &mut binding(&repo), &ws, false)
            .await
            .unwrap();

        assert_eq!(run.failed_step(), Some("broken"));
        assert_eq!(run.completed_steps, vec!["first".to_string()]);
        assert!(!repo.join("local-chains/b.json").exists());
        assert_eq!(run.diffs["server"].files, vec!["local-chains/a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_only_retryable_failures() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("server");
        init_repo(&repo);
        let ws = Workspace::acquire(temp.path().join("ws"), false, WorkspaceMode::Fresh)
            .await
            .unwrap();

        // Fails on the first attempt, succeeds on the second.
        let script = "if [ -f .attempted ]; then exit 0; else touch .attempted; exit 1; fi";
        let mut flaky = ProcessStep::new("sh").args(["-c", script]);
        flaky.retryable = true;

        let mut p = pipeline(vec![Step::process("flaky", flaky)]);
        p.retry_policy.max_attempts = 2;
        p.retry_policy.initial_delay_ms = 10;

        let run = Orchestrator::new()
            .run(&p, &mut binding(&repo), &ws, false)
            .await
            .unwrap();

        assert!(run.succeeded());
        let events = Journal::new(ws.journal_path()).replay().await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::StepRetrying));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("server");
        init_repo(&repo);
        let ws = Workspace::acquire(temp.path().join("ws"), false, WorkspaceMode::Fresh)
            .await
            .unwrap();

        let (handle, token) = crate::core::cancel::cancellation();
        handle.cancel();

        let p = pipeline(vec![write_step("first", "local-chains/a.json")]);
        let run = Orchestrator::with_cancellation(token)
            .run(&p, &mut binding(&repo), &ws, false)
            .await
            .unwrap();

        assert!(run.is_cancelled());
        assert_eq!(run.exit_code(), 130);
        assert!(run.completed_steps.is_empty());
        assert!(!repo.join("local-chains/a.json").exists());
    }
}
