//! Tool preflight.
//!
//! Recipes declare the programs they shell out to together with a version
//! requirement (`cargo: ">=1.89"`, `forge: "==0.0.4"`). Every requirement is
//! checked before the first step runs by asking the program for
//! `--version` and comparing the first `X.Y[.Z]` it prints.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use semver::{Version, VersionReq};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolchainError {
    #[error("Invalid version requirement '{requirement}' for '{program}': {message}")]
    InvalidRequirement {
        program: String,
        requirement: String,
        message: String,
    },

    #[error("Required tool '{0}' is not installed")]
    Missing(String),

    #[error("Could not determine the version of '{program}': {output}")]
    UnknownVersion { program: String, output: String },

    #[error("'{program}' {found} does not satisfy {required}")]
    Unsatisfied {
        program: String,
        found: Version,
        required: String,
    },
}

/// A program and the versions of it a recipe accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequirement {
    pub program: String,
    pub requirement: VersionReq,
    declared: String,
}

impl ToolRequirement {
    /// Parse a requirement such as `>=1.89`, `==0.0.4` or `>=2, <3`
    pub fn parse(program: &str, requirement: &str) -> Result<Self, ToolchainError> {
        // `==` pins an exact version
        let normalized = requirement.trim().replace("==", "=");
        let parsed =
            VersionReq::parse(&normalized).map_err(|e| ToolchainError::InvalidRequirement {
                program: program.to_string(),
                requirement: requirement.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            program: program.to_string(),
            requirement: parsed,
            declared: requirement.trim().to_string(),
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.requirement.matches(version)
    }
}

impl fmt::Display for ToolRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.declared)
    }
}

/// First `X.Y[.Z]` in a `--version` banner; a missing patch is 0
pub fn parse_version(output: &str) -> Option<Version> {
    let pattern = Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
    let captures = pattern.captures(output)?;
    let part = |i: usize| -> Option<u64> {
        match captures.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

/// Ask `program --version` for its version
pub async fn installed_version(program: &str) -> Result<Version, ToolchainError> {
    let unknown = |output: String| ToolchainError::UnknownVersion {
        program: program.to_string(),
        output,
    };

    let invocation = Command::new(program)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    let output = match timeout(VERSION_TIMEOUT, invocation).await {
        Err(_) => return Err(unknown("timed out".to_string())),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolchainError::Missing(program.to_string()))
        }
        Ok(Err(e)) => return Err(unknown(e.to_string())),
        Ok(Ok(output)) => output,
    };

    let banner = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        return Err(unknown(format!("{}: {}", output.status, banner.trim())));
    }

    let version = parse_version(&banner).ok_or_else(|| unknown(banner.trim().to_string()))?;
    debug!(program, %version, "Detected tool version");
    Ok(version)
}

/// Check every requirement; the first unmet one is the error
pub async fn preflight(requirements: &[ToolRequirement]) -> Result<(), ToolchainError> {
    for requirement in requirements {
        let found = installed_version(&requirement.program).await?;
        if !requirement.matches(&found) {
            return Err(ToolchainError::Unsatisfied {
                program: requirement.program.clone(),
                found,
                required: requirement.declared.clone(),
            });
        }
        info!(tool = %requirement.program, version = %found, "Tool requirement met");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_banners() {
        assert_eq!(
            parse_version("cargo 1.89.0 (c24e10642 2025-06-23)"),
            Some(Version::new(1, 89, 0))
        );
        assert_eq!(parse_version("git version 2.43.0\n"), Some(Version::new(2, 43, 0)));
        assert_eq!(parse_version("gsutil version: 5.27"), Some(Version::new(5, 27, 0)));
        assert_eq!(
            parse_version("forge Version: 0.0.4-nightly"),
            Some(Version::new(0, 0, 4))
        );
        assert_eq!(parse_version("yarn: unknown"), None);
    }

    #[test]
    fn test_requirement_operators() {
        let exact = ToolRequirement::parse("forge", "==0.0.4").unwrap();
        assert!(exact.matches(&Version::new(0, 0, 4)));
        assert!(!exact.matches(&Version::new(0, 0, 5)));
        assert_eq!(exact.to_string(), "forge ==0.0.4");

        let minimum = ToolRequirement::parse("cargo", ">=1.89").unwrap();
        assert!(minimum.matches(&Version::new(1, 89, 0)));
        assert!(minimum.matches(&Version::new(1, 90, 1)));
        assert!(!minimum.matches(&Version::new(1, 80, 0)));

        let range = ToolRequirement::parse("cmake", ">=3, <4").unwrap();
        assert!(range.matches(&Version::new(3, 28, 1)));
        assert!(!range.matches(&Version::new(4, 0, 0)));
    }

    #[test]
    fn test_invalid_requirement() {
        let err = ToolRequirement::parse("yarn", "newest").unwrap_err();
        assert!(matches!(err, ToolchainError::InvalidRequirement { ref program, .. } if program == "yarn"));
    }

    #[tokio::test]
    async fn test_preflight() {
        let git_any = ToolRequirement::parse("git", ">=1").unwrap();
        assert!(preflight(&[git_any.clone()]).await.is_ok());

        let git_ancient = ToolRequirement::parse("git", "<1").unwrap();
        let err = preflight(&[git_any, git_ancient]).await.unwrap_err();
        assert!(matches!(err, ToolchainError::Unsatisfied { ref program, .. } if program == "git"));

        let missing = ToolRequirement::parse("protoctl-no-such-tool", ">=1").unwrap();
        assert_eq!(
            preflight(&[missing]).await.unwrap_err(),
            ToolchainError::Missing("protoctl-no-such-tool".into())
        );
    }
}
