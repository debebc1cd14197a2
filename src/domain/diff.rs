//! Scoped working-tree changes of a repository.

use serde::{Deserialize, Serialize};

/// Changes a run left in one repository, restricted to its touched paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDiff {
    /// Repository identifier within the pipeline
    pub repository: String,

    /// Revision the diff is computed against
    pub baseline: String,

    /// Changed files inside the touched paths (repo-relative, sorted)
    pub files: Vec<String>,

    /// Changed files outside the touched paths; never published
    #[serde(default)]
    pub out_of_scope: Vec<String>,

    /// Unified diff (git binary format) of `files` against `baseline`,
    /// byte for byte as git produced it
    #[serde(skip)]
    pub patch: Vec<u8>,
}

impl RepoDiff {
    /// An empty diff for a repository
    pub fn empty(repository: impl Into<String>, baseline: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            baseline: baseline.into(),
            ..Default::default()
        }
    }

    /// True when nothing inside the touched paths changed
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
