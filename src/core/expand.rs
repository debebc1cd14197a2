//! Placeholder substitution for recipe strings.
//!
//! Recognized tokens: `{workspace}`, `{repo.<id>}` and `{param.<KEY>}`.
//! Any other brace sequence is left untouched so arguments may carry
//! literal JSON. Substitution happens per argument; nothing is ever handed
//! to a shell.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use super::repository::RepositorySet;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("Unknown repository '{0}' in placeholder")]
    UnknownRepository(String),

    #[error("Unknown parameter '{0}' in placeholder")]
    UnknownParam(String),
}

/// A placeholder found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Workspace,
    Repo(String),
    Param(String),
}

/// Values placeholders resolve to
pub struct Expander<'a> {
    pub workspace: &'a Path,
    pub repositories: &'a RepositorySet,
    pub params: &'a BTreeMap<String, String>,
}

impl Expander<'_> {
    pub fn expand(&self, template: &str) -> Result<String, ExpandError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some((before, token, after)) = next_placeholder(rest) {
            out.push_str(before);
            match token {
                Placeholder::Workspace => out.push_str(&self.workspace.to_string_lossy()),
                Placeholder::Repo(id) => {
                    let repo = self
                        .repositories
                        .get(&id)
                        .ok_or(ExpandError::UnknownRepository(id))?;
                    out.push_str(&repo.root().to_string_lossy());
                }
                Placeholder::Param(key) => {
                    let value = self.params.get(&key).ok_or(ExpandError::UnknownParam(key))?;
                    out.push_str(value);
                }
            }
            rest = after;
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// All placeholders referenced by a template
pub fn placeholders(template: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some((_, token, after)) = next_placeholder(rest) {
        found.push(token);
        rest = after;
    }
    found
}

fn next_placeholder(s: &str) -> Option<(&str, Placeholder, &str)> {
    let mut search_from = 0;
    while let Some(offset) = s[search_from..].find('{') {
        let open = search_from + offset;
        let Some(len) = s[open..].find('}') else {
            return None;
        };
        let inner = &s[open + 1..open + len];
        let token = if inner == "workspace" {
            Some(Placeholder::Workspace)
        } else if let Some(id) = inner.strip_prefix("repo.").filter(|v| is_name(v)) {
            Some(Placeholder::Repo(id.to_string()))
        } else {
            inner
                .strip_prefix("param.")
                .filter(|v| is_name(v))
                .map(|k| Placeholder::Param(k.to_string()))
        };

        match token {
            Some(token) => return Some((&s[..open], token, &s[open + len + 1..])),
            None => search_from = open + 1,
        }
    }
    None
}

fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
