//! Pipeline definitions and loading.
//!
//! Pipelines (recipes) are defined in YAML and consist of the repositories
//! they touch, the parameters they need, and an ordered list of typed steps.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::expand::{placeholders, Placeholder};
use super::scope::TouchedPaths;
use super::toolchain::ToolRequirement;

/// Config key holding the primary repository root
pub const REPO_DIR_KEY: &str = "REPO_DIR";

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// What the run upgrades; both fields accept placeholders
    pub subject: SubjectTemplate,

    /// Recipe parameters resolved from configuration
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,

    /// Repositories the steps operate on
    pub repositories: Vec<RepositorySpec>,

    /// Programs that must be installed, with version requirements
    #[serde(default)]
    pub requires: BTreeMap<String, String>,

    /// Further tool requirements selected by a parameter's value
    #[serde(default)]
    pub toolchains: Option<ToolchainTable>,

    /// Uniform retry policy for retryable step failures
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Default timeout for external processes
    #[serde(default)]
    pub step_timeout_seconds: Option<u64>,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        if self.repositories.is_empty() {
            anyhow::bail!("Pipeline must bind at least one repository");
        }

        let mut repo_ids = HashSet::new();
        for repo in &self.repositories {
            if repo.id.is_empty() {
                anyhow::bail!("Repository id cannot be empty");
            }
            if !repo_ids.insert(repo.id.as_str()) {
                anyhow::bail!("Duplicate repository id '{}'", repo.id);
            }
            TouchedPaths::new(&repo.touched_paths).with_context(|| {
                format!("Invalid touched path glob in repository '{}'", repo.id)
            })?;
        }

        let mut step_names = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if !step_names.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }

            for repo in step.action.repositories() {
                if !repo_ids.contains(repo) {
                    anyhow::bail!(
                        "Step '{}' references undeclared repository '{}'",
                        step.name,
                        repo
                    );
                }
            }
        }

        for (program, requirement) in &self.requires {
            ToolRequirement::parse(program, requirement)?;
        }
        if let Some(table) = &self.toolchains {
            if !self.params.contains_key(&table.param) {
                anyhow::bail!(
                    "Toolchain table is keyed by undeclared parameter '{}'",
                    table.param
                );
            }
            for tools in table.versions.values() {
                for (program, requirement) in tools {
                    ToolRequirement::parse(program, requirement)?;
                }
            }
        }

        for template in self.templates() {
            for placeholder in placeholders(template) {
                match placeholder {
                    Placeholder::Repo(id) if !repo_ids.contains(id.as_str()) => {
                        anyhow::bail!("Placeholder references undeclared repository '{}'", id)
                    }
                    Placeholder::Param(key) if !self.params.contains_key(&key) => {
                        anyhow::bail!("Placeholder references undeclared parameter '{}'", key)
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Every configuration key this pipeline reads besides the engine keys
    pub fn recipe_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.params.keys().cloned().collect();
        for repo in &self.repositories {
            if repo.root_key != REPO_DIR_KEY && !keys.contains(&repo.root_key) {
                keys.push(repo.root_key.clone());
            }
        }
        keys
    }

    fn templates(&self) -> Vec<&str> {
        let mut out = vec![self.subject.tag.as_str(), self.subject.version.as_str()];
        for step in &self.steps {
            step.action.collect_templates(&mut out);
        }
        out
    }
}

/// Tool requirements per value of one parameter, e.g. per protocol version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainTable {
    /// Parameter whose value selects the row
    pub param: String,

    /// Parameter value -> program -> version requirement
    pub versions: BTreeMap<String, BTreeMap<String, String>>,
}

/// Subject of a run before placeholder expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectTemplate {
    pub tag: String,
    pub version: String,
}

/// A recipe parameter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Value used when the key is absent
    #[serde(default)]
    pub default: Option<String>,

    /// Absent keys without default fail before any step runs
    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default)]
    pub description: String,
}

fn default_required() -> bool {
    true
}

/// A repository the pipeline operates on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySpec {
    /// Identifier used by steps and placeholders
    pub id: String,

    /// Configuration key holding the checkout root
    #[serde(default = "default_root_key")]
    pub root_key: String,

    /// Globs (repo-relative) the pipeline may modify
    #[serde(default)]
    pub touched_paths: Vec<String>,
}

fn default_root_key() -> String {
    REPO_DIR_KEY.to_string()
}

/// A single step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within pipeline)
    pub name: String,

    /// Safe to re-run after a partial failure (advisory)
    #[serde(default)]
    pub idempotent: bool,

    /// Expected duration, reported against the actual one
    #[serde(default)]
    pub expected_seconds: Option<u64>,

    /// What the step does
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            idempotent: false,
            expected_seconds: None,
            action,
        }
    }

    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, StepAction::Noop)
    }

    pub fn files(name: impl Into<String>, operations: Vec<FileOp>) -> Self {
        Self::new(name, StepAction::Files { operations })
    }

    pub fn process(name: impl Into<String>, process: ProcessStep) -> Self {
        Self::new(name, StepAction::Process(process))
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Effective timeout for an external-process step
    pub fn timeout(&self, default_seconds: Option<u64>) -> Option<Duration> {
        match &self.action {
            StepAction::Process(p) => p.timeout_seconds.or(default_seconds).map(Duration::from_secs),
            _ => None,
        }
    }
}

/// The effect a step has
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Marker step; does nothing
    Noop,

    /// File mutations, each checked against the touched paths
    Files { operations: Vec<FileOp> },

    /// External process invocation
    Process(ProcessStep),
}

impl StepAction {
    fn repositories(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Self::Noop => {}
            Self::Files { operations } => {
                for op in operations {
                    for location in op.locations() {
                        if let Location::Repo { repo, .. } = location {
                            out.push(repo.as_str());
                        }
                    }
                }
            }
            Self::Process(p) => {
                if let Some(Location::Repo { repo, .. }) = &p.cwd {
                    out.push(repo.as_str());
                }
            }
        }
        out
    }

    fn collect_templates<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Noop => {}
            Self::Files { operations } => {
                for op in operations {
                    for location in op.locations() {
                        out.push(location.template());
                    }
                    match op {
                        FileOp::Write { contents, .. } => out.push(contents),
                        FileOp::Replace { find, replace, .. } => {
                            out.push(find);
                            out.push(replace);
                        }
                        FileOp::Download { url, .. } => out.push(url),
                        FileOp::Copy { .. } | FileOp::Remove { .. } => {}
                    }
                }
            }
            Self::Process(p) => {
                out.push(&p.program);
                out.extend(p.args.iter().map(String::as_str));
                out.extend(p.env.values().map(String::as_str));
                if let Some(cwd) = &p.cwd {
                    out.push(cwd.template());
                }
            }
        }
    }
}

/// A file operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    /// Copy a file; the source must exist
    Copy { from: Location, to: Location },

    /// Write literal contents
    Write { to: Location, contents: String },

    /// Replace every occurrence of `find`; fails if there is none
    Replace {
        target: Location,
        find: String,
        replace: String,
    },

    /// Remove a file or directory (absent is fine)
    Remove { target: Location },

    /// Download a URL, optionally verifying its SHA-256
    Download {
        url: String,
        to: Location,
        #[serde(default)]
        sha256: Option<String>,
    },
}

impl FileOp {
    /// Locations this operation writes to
    pub fn write_targets(&self) -> Vec<&Location> {
        match self {
            Self::Copy { to, .. } | Self::Write { to, .. } | Self::Download { to, .. } => vec![to],
            Self::Replace { target, .. } | Self::Remove { target } => vec![target],
        }
    }

    fn locations(&self) -> Vec<&Location> {
        match self {
            Self::Copy { from, to } => vec![from, to],
            _ => self.write_targets(),
        }
    }
}

/// Where a file lives
///
/// Supports these YAML forms:
/// - Repository file: `{ repo: server, path: configs/genesis.json }`
/// - Workspace file: `{ workspace: setup.key }`
/// - External (read-only) file: `{ external: /opt/keys/setup.key }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Repo { repo: String, path: String },
    Workspace { workspace: String },
    External { external: String },
}

impl Location {
    pub fn repo(repo: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Repo {
            repo: repo.into(),
            path: path.into(),
        }
    }

    pub fn workspace(path: impl Into<String>) -> Self {
        Self::Workspace {
            workspace: path.into(),
        }
    }

    pub fn external(path: impl Into<String>) -> Self {
        Self::External {
            external: path.into(),
        }
    }

    fn template(&self) -> &str {
        match self {
            Self::Repo { path, .. } => path,
            Self::Workspace { workspace } => workspace,
            Self::External { external } => external,
        }
    }
}

/// An external process invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStep {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory (default: root of the first repository)
    #[serde(default)]
    pub cwd: Option<Location>,

    /// Environment overrides on top of the inherited environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Exit codes that count as success
    #[serde(default = "default_allowed_exit_codes")]
    pub allowed_exit_codes: Vec<i32>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Failures may be retried by the pipeline's retry policy
    #[serde(default)]
    pub retryable: bool,
}

fn default_allowed_exit_codes() -> Vec<i32> {
    vec![0]
}

impl ProcessStep {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            allowed_exit_codes: default_allowed_exit_codes(),
            timeout_seconds: None,
            retryable: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_exit_codes(mut self, codes: &[i32]) -> Self {
        self.allowed_exit_codes = codes.to_vec();
        self
    }
}

/// Retry policy for retryable step failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PIPELINE_YAML: &str = r#"
name: update-prover
description: Copy a released binary into the prover repo

subject:
  tag: zksync-airbender
  version: "{param.ZKSYNC_OS_TAG}"

params:
  ZKSYNC_OS_TAG: {}
  ZKSYNC_OS_URL:
    default: https://github.com/matter-labs/zksync-os

repositories:
  - id: prover
    touched_paths: [multiblock_batch.bin]

steps:
  - name: download
    idempotent: true
    expected_seconds: 20
    action:
      kind: files
      operations:
        - op: download
          url: "{param.ZKSYNC_OS_URL}/releases/download/{param.ZKSYNC_OS_TAG}/multiblock_batch.bin"
          to: { workspace: multiblock_batch.bin }

  - name: copy
    idempotent: true
    action:
      kind: files
      operations:
        - op: copy
          from: { workspace: multiblock_batch.bin }
          to: { repo: prover, path: multiblock_batch.bin }

  - name: check
    action:
      kind: process
      program: cargo
      args: [check]
      allowed_exit_codes: [0, 101]
"#;

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();

        assert_eq!(pipeline.name, "update-prover");
        assert_eq!(pipeline.steps.len(), 3);
        assert!(pipeline.params["ZKSYNC_OS_TAG"].required);
        assert_eq!(pipeline.repositories[0].root_key, REPO_DIR_KEY);
        assert_eq!(pipeline.retry_policy.max_attempts, 1);

        match &pipeline.steps[1].action {
            StepAction::Files { operations } => match &operations[0] {
                FileOp::Copy { from, to } => {
                    assert_eq!(from, &Location::workspace("multiblock_batch.bin"));
                    assert_eq!(to, &Location::repo("prover", "multiblock_batch.bin"));
                }
                other => panic!("unexpected op: {:?}", other),
            },
            other => panic!("unexpected action: {:?}", other),
        }

        match &pipeline.steps[2].action {
            StepAction::Process(p) => assert_eq!(p.allowed_exit_codes, vec![0, 101]),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_pipeline_validation() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        assert!(pipeline.validate().is_ok());
        assert_eq!(
            pipeline.recipe_keys(),
            vec!["ZKSYNC_OS_TAG".to_string(), "ZKSYNC_OS_URL".to_string()]
        );
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let mut pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        pipeline.steps.push(Step::noop("copy"));
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_undeclared_repository_rejected() {
        let mut pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        pipeline.steps.push(Step::files(
            "stray",
            vec![FileOp::Remove {
                target: Location::repo("contracts", "foo"),
            }],
        ));
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_undeclared_param_rejected() {
        let mut pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        pipeline.steps.push(Step::process(
            "gen",
            ProcessStep::new("cargo").args(["run", "--", "{param.PROTOCOL_VERSION}"]),
        ));
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_tool_requirements_validated() {
        let mut pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        pipeline.requires.insert("cargo".into(), ">=1.89".into());
        assert!(pipeline.validate().is_ok());

        pipeline.requires.insert("yarn".into(), "latest".into());
        assert!(pipeline.validate().is_err());
        pipeline.requires.remove("yarn");

        pipeline.toolchains = Some(ToolchainTable {
            param: "PROTOCOL_VERSION".into(),
            versions: BTreeMap::new(),
        });
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("PROTOCOL_VERSION"));
    }

    #[test]
    fn test_process_timeout_resolution() {
        let step = Step::process("build", ProcessStep::new("cargo"));
        assert_eq!(step.timeout(Some(30)), Some(Duration::from_secs(30)));
        assert_eq!(step.timeout(None), None);

        let mut explicit = ProcessStep::new("cargo");
        explicit.timeout_seconds = Some(5);
        let step = Step::process("build", explicit);
        assert_eq!(step.timeout(Some(30)), Some(Duration::from_secs(5)));

        assert_eq!(Step::noop("marker").timeout(Some(30)), None);
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 3000,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000)); // Capped
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_default_policy_never_retries() {
        assert!(!RetryPolicy::default().should_retry(1));
    }
}
