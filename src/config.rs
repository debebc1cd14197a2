//! Engine configuration.
//!
//! Configuration sources:
//! 1. Process environment (`from_env`); unrelated variables are ignored
//! 2. Options file (`from_yaml_file`, flat YAML mapping); unknown keys fail
//!
//! Engine keys:
//! - `REPO_DIR` (required): root of the primary repository
//! - `WORKSPACE` (default `.workspace`)
//! - `VERBOSE`, `DRY_RUN` (default false)
//! - `COMMIT_CHANGES`, `OPEN_PR` (default: true when `CI` is truthy)
//! - `GIT_REMOTE` (default `origin`)
//!
//! Recipe keys are declared by the pipeline (`params` plus repository root
//! keys) and passed through unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::expand::Expander;
use crate::core::orchestrator::RunBinding;
use crate::core::pipeline::{Pipeline, REPO_DIR_KEY};
use crate::core::repository::{RepositoryHandle, RepositorySet};
use crate::core::scope::TouchedPaths;
use crate::core::toolchain::ToolRequirement;
use crate::domain::Subject;

const WORKSPACE_KEY: &str = "WORKSPACE";
const VERBOSE_KEY: &str = "VERBOSE";
const COMMIT_CHANGES_KEY: &str = "COMMIT_CHANGES";
const OPEN_PR_KEY: &str = "OPEN_PR";
const DRY_RUN_KEY: &str = "DRY_RUN";
const GIT_REMOTE_KEY: &str = "GIT_REMOTE";
const CI_KEY: &str = "CI";

const ENGINE_KEYS: &[&str] = &[
    REPO_DIR_KEY,
    WORKSPACE_KEY,
    VERBOSE_KEY,
    COMMIT_CHANGES_KEY,
    OPEN_PR_KEY,
    DRY_RUN_KEY,
    GIT_REMOTE_KEY,
    CI_KEY,
];

const DEFAULT_WORKSPACE: &str = ".workspace";
const DEFAULT_REMOTE: &str = "origin";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required configuration key '{0}'")]
    MissingKey(String),

    #[error("Unknown configuration key '{0}'")]
    UnknownKey(String),

    #[error("Invalid boolean for '{key}': '{value}' (expected 1/true/yes/on or 0/false/no/off)")]
    InvalidBool { key: String, value: String },

    #[error("Invalid options file {path}: {message}")]
    InvalidFile { path: PathBuf, message: String },

    #[error("Invalid subject template: {0}")]
    InvalidSubject(String),

    #[error("Invalid touched paths for repository '{repository}': {message}")]
    InvalidTouchedPaths { repository: String, message: String },

    #[error("Unsupported {param} '{value}' (supported: {supported})")]
    UnsupportedToolchain {
        param: String,
        value: String,
        supported: String,
    },

    #[error("{0}")]
    InvalidRequirement(String),
}

/// Validated engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub repo_dir: PathBuf,
    pub workspace: PathBuf,
    pub verbose: bool,
    pub commit_changes: bool,
    pub open_pr: bool,
    pub dry_run: bool,
    pub git_remote: String,

    /// Recipe keys present in the source, passed through unchanged
    pub options: BTreeMap<String, String>,
}

impl EngineConfig {
    /// Read from the process environment
    pub fn from_env(recipe_keys: &[String]) -> Result<Self, ConfigError> {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars, recipe_keys, false)
    }

    /// Read a flat YAML mapping of options; scalars are stringified
    pub fn from_yaml_file(path: &Path, recipe_keys: &[String]) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidFile {
            path: path.to_path_buf(),
            message,
        };

        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let raw: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?;

        let mut map = BTreeMap::new();
        for (key, value) in raw {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                _ => return Err(invalid(format!("value of '{}' must be a scalar", key))),
            };
            map.insert(key, value);
        }

        Self::from_map(&map, recipe_keys, true)
    }

    /// Build from a mapping. In `strict` mode every key must be an engine
    /// key or one of `recipe_keys`.
    pub fn from_map(
        map: &BTreeMap<String, String>,
        recipe_keys: &[String],
        strict: bool,
    ) -> Result<Self, ConfigError> {
        if strict {
            if let Some(unknown) = map
                .keys()
                .find(|k| !ENGINE_KEYS.contains(&k.as_str()) && !recipe_keys.contains(k))
            {
                return Err(ConfigError::UnknownKey(unknown.clone()));
            }
        }

        let repo_dir = map
            .get(REPO_DIR_KEY)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingKey(REPO_DIR_KEY.to_string()))?;

        let ci = bool_key(map, CI_KEY, false)?;

        Ok(Self {
            repo_dir: absolute(repo_dir),
            workspace: absolute(
                map.get(WORKSPACE_KEY)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_WORKSPACE),
            ),
            verbose: bool_key(map, VERBOSE_KEY, false)?,
            commit_changes: bool_key(map, COMMIT_CHANGES_KEY, ci)?,
            open_pr: bool_key(map, OPEN_PR_KEY, ci)?,
            dry_run: bool_key(map, DRY_RUN_KEY, false)?,
            git_remote: map
                .get(GIT_REMOTE_KEY)
                .cloned()
                .unwrap_or_else(|| DEFAULT_REMOTE.to_string()),
            options: map
                .iter()
                .filter(|(k, _)| recipe_keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    /// A recipe key's value; set-but-empty counts as unset
    fn option(&self, key: &str) -> Option<&String> {
        self.options.get(key).filter(|v| !v.is_empty())
    }

    /// Bind `pipeline` to this configuration: resolve parameters, repository
    /// roots and the subject. Fails before any step runs.
    pub fn bind(&self, pipeline: &Pipeline) -> Result<RunBinding, ConfigError> {
        let mut params = BTreeMap::new();
        for (key, spec) in &pipeline.params {
            match self.option(key).or(spec.default.as_ref()) {
                Some(value) => {
                    params.insert(key.clone(), value.clone());
                }
                None if spec.required => return Err(ConfigError::MissingKey(key.clone())),
                None => {}
            }
        }

        let mut handles = Vec::with_capacity(pipeline.repositories.len());
        for spec in &pipeline.repositories {
            let root = if spec.root_key == REPO_DIR_KEY {
                self.repo_dir.clone()
            } else {
                self.option(&spec.root_key)
                    .map(|v| absolute(v))
                    .ok_or_else(|| ConfigError::MissingKey(spec.root_key.clone()))?
            };
            let touched = TouchedPaths::new(&spec.touched_paths).map_err(|e| {
                ConfigError::InvalidTouchedPaths {
                    repository: spec.id.clone(),
                    message: e.to_string(),
                }
            })?;
            handles.push(RepositoryHandle::new(&spec.id, root, touched));
        }
        let repositories = RepositorySet::new(handles);

        let expander = Expander {
            workspace: &self.workspace,
            repositories: &repositories,
            params: &params,
        };
        let expand = |template: &str| {
            expander
                .expand(template)
                .map_err(|e| ConfigError::InvalidSubject(e.to_string()))
        };
        let subject = Subject::new(
            expand(&pipeline.subject.tag)?,
            expand(&pipeline.subject.version)?,
        );

        let tools = resolve_tools(pipeline, &params)?;

        Ok(RunBinding {
            subject,
            params,
            repositories,
            tools,
        })
    }
}

/// The recipe's fixed requirements plus the toolchain row its parameter selects
fn resolve_tools(
    pipeline: &Pipeline,
    params: &BTreeMap<String, String>,
) -> Result<Vec<ToolRequirement>, ConfigError> {
    let mut declared = pipeline.requires.clone();
    if let Some(table) = &pipeline.toolchains {
        let value = params
            .get(&table.param)
            .ok_or_else(|| ConfigError::MissingKey(table.param.clone()))?;
        let row = table
            .versions
            .get(value)
            .ok_or_else(|| ConfigError::UnsupportedToolchain {
                param: table.param.clone(),
                value: value.clone(),
                supported: table.versions.keys().cloned().collect::<Vec<_>>().join(", "),
            })?;
        declared.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    declared
        .iter()
        .map(|(program, requirement)| ToolRequirement::parse(program, requirement))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidRequirement(e.to_string()))
}

fn bool_key(map: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(value) => parse_bool(value).ok_or_else(|| ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.clone(),
        }),
    }
}

/// Parse `1/true/yes/on` and `0/false/no/off`, case-insensitively
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn absolute(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const RECIPE: &str = r#"
name: update-vk
subject:
  tag: zksync-airbender
  version: "{param.ZKSYNC_OS_TAG}"
params:
  ZKSYNC_OS_TAG: {}
  CRS_URL:
    default: https://example.com/setup.key
repositories:
  - id: prover
  - id: contracts
    root_key: CONTRACTS_DIR
    touched_paths: ["l1-contracts/**"]
steps:
  - name: marker
    action: { kind: noop }
"#;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_map(&map(&[("REPO_DIR", "/src/prover")]), &[], false).unwrap();

        assert_eq!(config.repo_dir, PathBuf::from("/src/prover"));
        assert!(config.workspace.ends_with(".workspace"));
        assert!(config.workspace.is_absolute());
        assert!(!config.verbose);
        assert!(!config.commit_changes);
        assert!(!config.open_pr);
        assert_eq!(config.git_remote, "origin");
    }

    #[test]
    fn test_ci_turns_on_publishing() {
        let config =
            EngineConfig::from_map(&map(&[("REPO_DIR", "/r"), ("CI", "true")]), &[], false).unwrap();
        assert!(config.commit_changes);
        assert!(config.open_pr);

        let config = EngineConfig::from_map(
            &map(&[("REPO_DIR", "/r"), ("CI", "1"), ("OPEN_PR", "no")]),
            &[],
            false,
        )
        .unwrap();
        assert!(config.commit_changes);
        assert!(!config.open_pr);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            EngineConfig::from_map(&map(&[]), &[], false),
            Err(ConfigError::MissingKey("REPO_DIR".into()))
        );
        assert_eq!(
            EngineConfig::from_map(&map(&[("REPO_DIR", "/r"), ("VERBOSE", "maybe")]), &[], false),
            Err(ConfigError::InvalidBool {
                key: "VERBOSE".into(),
                value: "maybe".into()
            })
        );
        assert_eq!(
            EngineConfig::from_map(&map(&[("REPO_DIR", "/r"), ("PROTOCOL_VERSON", "v31")]), &[], true),
            Err(ConfigError::UnknownKey("PROTOCOL_VERSON".into()))
        );
        // Environment mode ignores unrelated keys
        assert!(EngineConfig::from_map(&map(&[("REPO_DIR", "/r"), ("HOME", "/root")]), &[], false).is_ok());
    }

    #[test]
    fn test_bind_resolves_params_roots_and_subject() {
        let pipeline = Pipeline::from_yaml(RECIPE).unwrap();
        let keys = pipeline.recipe_keys();
        let config = EngineConfig::from_map(
            &map(&[
                ("REPO_DIR", "/src/prover"),
                ("CONTRACTS_DIR", "/src/contracts"),
                ("ZKSYNC_OS_TAG", "v0.4.0"),
            ]),
            &keys,
            true,
        )
        .unwrap();

        let binding = config.bind(&pipeline).unwrap();
        assert_eq!(binding.subject, Subject::new("zksync-airbender", "v0.4.0"));
        assert_eq!(binding.params["CRS_URL"], "https://example.com/setup.key");
        assert_eq!(
            binding.repositories.get("contracts").unwrap().root(),
            Path::new("/src/contracts")
        );
        assert_eq!(
            binding.repositories.primary().unwrap().root(),
            Path::new("/src/prover")
        );
    }

    #[test]
    fn test_bind_missing_param() {
        let pipeline = Pipeline::from_yaml(RECIPE).unwrap();
        let config = EngineConfig::from_map(
            &map(&[("REPO_DIR", "/src/prover"), ("CONTRACTS_DIR", "/c")]),
            &pipeline.recipe_keys(),
            true,
        )
        .unwrap();

        assert_eq!(
            config.bind(&pipeline).unwrap_err(),
            ConfigError::MissingKey("ZKSYNC_OS_TAG".into())
        );
    }

    #[test]
    fn test_bind_treats_empty_values_as_missing() {
        let pipeline = Pipeline::from_yaml(RECIPE).unwrap();
        let bind = |pairs: &[(&str, &str)]| {
            EngineConfig::from_map(&map(pairs), &pipeline.recipe_keys(), true)
                .unwrap()
                .bind(&pipeline)
        };

        assert_eq!(
            bind(&[
                ("REPO_DIR", "/src/prover"),
                ("CONTRACTS_DIR", "/c"),
                ("ZKSYNC_OS_TAG", ""),
            ])
            .unwrap_err(),
            ConfigError::MissingKey("ZKSYNC_OS_TAG".into())
        );
        assert_eq!(
            bind(&[
                ("REPO_DIR", "/src/prover"),
                ("CONTRACTS_DIR", ""),
                ("ZKSYNC_OS_TAG", "v0.4.0"),
            ])
            .unwrap_err(),
            ConfigError::MissingKey("CONTRACTS_DIR".into())
        );

        // An empty optional value falls back to its default
        let binding = bind(&[
            ("REPO_DIR", "/src/prover"),
            ("CONTRACTS_DIR", "/c"),
            ("ZKSYNC_OS_TAG", "v0.4.0"),
            ("CRS_URL", ""),
        ])
        .unwrap();
        assert_eq!(binding.params["CRS_URL"], "https://example.com/setup.key");
    }

    #[test]
    fn test_bind_selects_toolchain_by_param() {
        let pipeline = Pipeline::from_yaml(
            r#"
name: update-era
subject: { tag: era-contracts, version: "{param.PROTOCOL_VERSION}" }
params:
  PROTOCOL_VERSION: { default: v30 }
repositories:
  - id: era
requires:
  git: ">=2"
toolchains:
  param: PROTOCOL_VERSION
  versions:
    v30: { cargo: ">=1.80.0", forge: "==0.0.4" }
steps:
  - name: marker
    action: { kind: noop }
"#,
        )
        .unwrap();
        pipeline.validate().unwrap();
        let bind = |pairs: &[(&str, &str)]| {
            EngineConfig::from_map(&map(pairs), &pipeline.recipe_keys(), true)
                .unwrap()
                .bind(&pipeline)
        };

        let binding = bind(&[("REPO_DIR", "/src/era")]).unwrap();
        let tools: Vec<String> = binding.tools.iter().map(|t| t.to_string()).collect();
        assert_eq!(tools, vec!["cargo >=1.80.0", "forge ==0.0.4", "git >=2"]);

        assert_eq!(
            bind(&[("REPO_DIR", "/src/era"), ("PROTOCOL_VERSION", "v29")]).unwrap_err(),
            ConfigError::UnsupportedToolchain {
                param: "PROTOCOL_VERSION".into(),
                value: "v29".into(),
                supported: "v30".into(),
            }
        );
    }

    #[test]
    fn test_options_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("options.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "REPO_DIR: /src/prover\nVERBOSE: true\nZKSYNC_OS_TAG: v0.4.0\nCOMMIT_CHANGES: 0"
        )
        .unwrap();

        let config =
            EngineConfig::from_yaml_file(&path, &["ZKSYNC_OS_TAG".to_string()]).unwrap();
        assert!(config.verbose);
        assert!(!config.commit_changes);
        assert_eq!(config.options["ZKSYNC_OS_TAG"], "v0.4.0");
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "TRUE", "yes", "On"] {
            assert_eq!(parse_bool(v), Some(true));
        }
        for v in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_bool(v), Some(false));
        }
        assert_eq!(parse_bool(""), None);
    }
}
