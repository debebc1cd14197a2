//! Command-line interface for protoctl.
//!
//! A thin front end: load a recipe, read configuration from the environment
//! (or an options file), run the pipeline and hand the result to the change
//! publisher.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, warn};

use crate::adapters::GhCli;
use crate::config::EngineConfig;
use crate::core::cancel::{cancellation, CancelHandle, Cancellation};
use crate::core::toolchain;
use crate::core::orchestrator::RunBinding;
use crate::core::publisher::{ChangePublisher, PublishMode};
use crate::core::workspace::{Workspace, WorkspaceMode, JOURNAL_FILE};
use crate::core::{Journal, Orchestrator, Pipeline, StepAction};
use crate::domain::{Event, EventType, RunState};

/// protoctl - multi-repository protocol upgrade pipelines
#[derive(Parser, Debug)]
#[command(name = "protoctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an upgrade recipe
    Run {
        /// Recipe name (looks for recipes/<name>.yaml) or path to a recipe file
        recipe: String,

        /// Continue the previous run of the workspace, skipping completed steps
        #[arg(long)]
        resume: bool,

        /// Read options from a YAML file instead of the environment
        #[arg(long, env = "PROTOCTL_OPTIONS")]
        options: Option<PathBuf>,
    },

    /// Show the latest run recorded in a workspace
    Status {
        /// Workspace root
        #[arg(long, env = "WORKSPACE", default_value = ".workspace")]
        workspace: PathBuf,
    },

    /// List available recipes
    Recipes {
        /// Recipe directory
        #[arg(long, default_value = "recipes")]
        dir: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command; returns the process exit code
    pub async fn execute(self) -> Result<i32> {
        match self.command {
            Commands::Run {
                recipe,
                resume,
                options,
            } => run_recipe(&recipe, resume, options.as_deref()).await,
            Commands::Status { workspace } => show_status(&workspace).await.map(|_| 0),
            Commands::Recipes { dir } => list_recipes(&dir).map(|_| 0),
        }
    }
}

async fn run_recipe(name: &str, resume: bool, options: Option<&Path>) -> Result<i32> {
    let pipeline = load_recipe(name)?;
    let keys = pipeline.recipe_keys();

    let config = match options {
        Some(path) => EngineConfig::from_yaml_file(path, &keys)?,
        None => EngineConfig::from_env(&keys)?,
    };
    let mut binding = config.bind(&pipeline)?;
    let mode = PublishMode::select(config.commit_changes, config.open_pr);

    if config.dry_run {
        print_plan(&pipeline, &binding, &config, mode);
        return Ok(0);
    }

    toolchain::preflight(&binding.tools)
        .await
        .context("Tool preflight failed")?;

    let workspace_mode = if resume {
        WorkspaceMode::Resume
    } else {
        WorkspaceMode::Fresh
    };
    let workspace = Workspace::acquire(&config.workspace, config.verbose, workspace_mode).await?;

    let (handle, token) = cancellation();
    let interrupt = tokio::spawn(async move {
        forward_interrupts(|| async { tokio::signal::ctrl_c().await.is_ok() }, handle).await;
        error!("Second interrupt received, exiting");
        std::process::exit(130);
    });

    let outcome = publish_run(&pipeline, &mut binding, &workspace, &config, resume, token).await;
    interrupt.abort();
    let code = outcome?;

    workspace.close()?;
    Ok(code)
}

/// The first interrupt cancels the run; returns on the second
async fn forward_interrupts<F, Fut>(mut interrupted: F, handle: CancelHandle)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if !interrupted().await {
        return std::future::pending().await;
    }
    warn!("Interrupt received, cancelling run (press Ctrl-C again to exit)");
    handle.cancel();

    if !interrupted().await {
        return std::future::pending().await;
    }
}

/// Run the pipeline and publish every repository; returns the exit code
async fn publish_run(
    pipeline: &Pipeline,
    binding: &mut RunBinding,
    workspace: &Workspace,
    config: &EngineConfig,
    resume: bool,
    token: Cancellation,
) -> Result<i32> {
    let run = Orchestrator::with_cancellation(token)
        .run(pipeline, binding, workspace, resume)
        .await?;

    let publisher = ChangePublisher::new(
        Box::new(GhCli::new()),
        &config.git_remote,
        workspace.root(),
    );
    let journal = Journal::new(workspace.journal_path());
    let mut publish_failed = false;

    for repo in binding.repositories.iter() {
        let Some(diff) = run.diffs.get(repo.id()) else {
            continue;
        };

        match publisher
            .publish(repo, diff, &run, config.commit_changes, config.open_pr)
            .await
        {
            Ok(outcome) => {
                println!("{}: {}", repo.id(), outcome);
                journal
                    .append(&Event::new(
                        run.id,
                        None,
                        EventType::Published,
                        format!("{}: {}", repo.id(), outcome),
                    ))
                    .await?;
            }
            Err(e) => {
                error!(repository = %repo.id(), error = %e, "Publish failed");
                eprintln!("{}: publish failed: {}", repo.id(), e);
                if let Some(branch) = e.pushed_branch() {
                    eprintln!("  Branch '{}' is pushed; the pull request must be opened manually", branch);
                }
                publish_failed = true;
            }
        }
    }

    if let Some(report) = run.failure_report() {
        eprintln!("\n{}", report);
    } else {
        eprintln!("\n[Run {} completed successfully]", run.id);
    }

    Ok(match run.exit_code() {
        0 if publish_failed => 1,
        code => code,
    })
}

fn print_plan(pipeline: &Pipeline, binding: &RunBinding, config: &EngineConfig, mode: PublishMode) {
    println!("Pipeline: {}", pipeline.name);
    if !pipeline.description.is_empty() {
        println!("  {}", pipeline.description);
    }
    println!("Subject: {}", binding.subject);
    println!("Workspace: {}", config.workspace.display());
    println!("Publish mode: {}", mode);

    println!("\nRepositories:");
    for repo in binding.repositories.iter() {
        println!("  {} ({})", repo.id(), repo.root().display());
        for glob in repo.touched_paths().globs() {
            println!("    touches {}", glob);
        }
    }

    if !binding.tools.is_empty() {
        println!("\nRequires:");
        for tool in &binding.tools {
            println!("  {}", tool);
        }
    }

    println!("\nSteps:");
    for (i, step) in pipeline.steps.iter().enumerate() {
        let kind = match &step.action {
            StepAction::Noop => "noop".to_string(),
            StepAction::Files { operations } => format!("files ({} ops)", operations.len()),
            StepAction::Process(p) => format!("process: {} {}", p.program, p.args.join(" ")),
        };
        println!(
            "  {:>2}. {:<28} {}{}",
            i + 1,
            step.name,
            kind,
            if step.idempotent { "  [idempotent]" } else { "" }
        );
    }
}

/// Show the latest run of a workspace
async fn show_status(workspace: &Path) -> Result<()> {
    let journal = Journal::new(workspace.join(JOURNAL_FILE));
    let Some(record) = journal.last_run().await? else {
        println!("No runs recorded in {}", workspace.display());
        return Ok(());
    };

    let state = match &record.state {
        RunState::Running => "running (or interrupted)".to_string(),
        RunState::Completed => "completed".to_string(),
        RunState::Failed { step, error } => format!(
            "failed at '{}': {}",
            step.as_deref().unwrap_or("?"),
            error
        ),
        RunState::Cancelled { step } => {
            format!("cancelled at '{}'", step.as_deref().unwrap_or("?"))
        }
    };

    println!("Run ID: {}", record.id);
    println!("Pipeline: {}", record.pipeline_name);
    println!("State: {}", state);
    println!("Started: {}", record.started_at);
    if let Some(completed) = record.completed_at {
        println!("Completed: {}", completed);
    }

    println!("\nBaselines:");
    for (repo, baseline) in &record.baselines {
        println!("  {}: {}", repo, baseline);
    }

    println!("\nStep statuses:");
    for (step, status) in &record.steps {
        println!("  {}: {:?}", step, status);
    }

    if !record.published.is_empty() {
        println!("\nPublished:");
        for line in &record.published {
            println!("  {}", line);
        }
    }

    Ok(())
}

fn list_recipes(dir: &Path) -> Result<()> {
    let pattern = dir.join("*.yaml");
    let pattern = pattern.to_string_lossy();

    let mut found = false;
    for entry in glob::glob(&pattern).context("Invalid recipe directory")? {
        let path = entry?;
        match Pipeline::from_file(&path) {
            Ok(pipeline) => {
                println!("{:<20} {}", pipeline.name, pipeline.description);
                found = true;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable recipe"),
        }
    }

    if !found {
        println!("No recipes found in {}", dir.display());
    }
    Ok(())
}

/// Load a recipe by name or path
fn load_recipe(name: &str) -> Result<Pipeline> {
    let direct = PathBuf::from(name);
    let recipe_path = PathBuf::from("recipes").join(format!("{}.yaml", name));

    let path = if direct.is_file() {
        direct
    } else if recipe_path.is_file() {
        recipe_path
    } else {
        anyhow::bail!(
            "Recipe '{}' not found. Looked for:\n  - {}\n  - {}",
            name,
            direct.display(),
            recipe_path.display()
        );
    };

    let pipeline = Pipeline::from_file(&path)?;
    pipeline
        .validate()
        .with_context(|| format!("Invalid recipe: {}", path.display()))?;
    Ok(pipeline)
}
