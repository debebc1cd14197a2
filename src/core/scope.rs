//! Touched-path scoping for repository mutations.
//!
//! Every repository handle carries a set of path globs the pipeline may
//! modify. File mutations are checked against this set before they reach the
//! filesystem, and diffs are computed strictly within it.

use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use thiserror::Error;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A mutation was attempted outside a repository's touched paths
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Path '{path}' is outside the touched paths of repository '{repository}'")]
pub struct ScopeViolation {
    pub repository: String,
    pub path: String,
}

/// Set of repo-relative globs a pipeline is allowed to modify
#[derive(Debug, Clone, Default)]
pub struct TouchedPaths {
    patterns: Vec<(String, Pattern)>,
}

impl TouchedPaths {
    /// Compile the globs. A glob without metacharacters also covers
    /// everything below it when it names a directory.
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self, glob::PatternError> {
        let patterns = globs
            .iter()
            .map(|g| {
                let raw = g.as_ref().trim_end_matches('/').to_string();
                Pattern::new(&raw).map(|p| (raw, p))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The globs as declared
    pub fn globs(&self) -> Vec<&str> {
        self.patterns.iter().map(|(raw, _)| raw.as_str()).collect()
    }

    /// Check a normalized repo-relative path
    pub fn contains(&self, relative: &Path) -> bool {
        self.patterns.iter().any(|(raw, pattern)| {
            pattern.matches_path_with(relative, MATCH_OPTIONS)
                || (!has_glob_meta(raw) && relative.starts_with(raw))
        })
    }

    /// Resolve `path` (relative to `root`, or absolute inside it) and verify
    /// it is in scope. Returns the absolute target on success.
    pub fn check(
        &self,
        repository: &str,
        root: &Path,
        path: &Path,
    ) -> Result<PathBuf, ScopeViolation> {
        let violation = || ScopeViolation {
            repository: repository.to_string(),
            path: path.display().to_string(),
        };

        let relative = if path.is_absolute() {
            path.strip_prefix(root).map_err(|_| violation())?
        } else {
            path
        };
        let normalized = normalize_relative(relative).ok_or_else(violation)?;

        if normalized.as_os_str().is_empty() || !self.contains(&normalized) {
            return Err(violation());
        }

        Ok(root.join(normalized))
    }

    /// Verify that `target`, already checked lexically, stays in scope once
    /// symlinks along its existing prefix are followed. Writes through a
    /// dangling link are refused.
    pub fn check_links(
        &self,
        repository: &str,
        root: &Path,
        target: &Path,
    ) -> Result<(), ScopeViolation> {
        let violation = || ScopeViolation {
            repository: repository.to_string(),
            path: target
                .strip_prefix(root)
                .unwrap_or(target)
                .display()
                .to_string(),
        };

        let canonical_root = root.canonicalize().map_err(|_| violation())?;
        let existing = target
            .ancestors()
            .find(|a| a.symlink_metadata().is_ok())
            .ok_or_else(violation)?;
        let resolved = existing.canonicalize().map_err(|_| violation())?;
        let remainder = target.strip_prefix(existing).map_err(|_| violation())?;

        let resolved = resolved.join(remainder);
        let relative = resolved
            .strip_prefix(&canonical_root)
            .map_err(|_| violation())?;

        if relative.as_os_str().is_empty() || !self.contains(relative) {
            return Err(violation());
        }
        Ok(())
    }
}

/// Lexically normalize a relative path; `None` if it escapes its base
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}
