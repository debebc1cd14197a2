//! Shared fixtures: git repositories in temp dirs with a bare remote.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use protoctl::core::{
    Pipeline, RepositoryHandle, RepositorySet, RunBinding, TouchedPaths, Workspace, WorkspaceMode,
};
use protoctl::Subject;
use tempfile::TempDir;

pub fn git(root: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A checkout of `server` cloned from a bare `remote.git`
pub struct Fixture {
    pub temp: TempDir,
    pub repo: PathBuf,
    pub remote: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let remote = temp.path().join("remote.git");
        let repo = temp.path().join("server");

        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "-q", "--bare", "-b", "main"]);

        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "-q", "-b", "main"]);
        git(&repo, &["config", "user.email", "ci@example.com"]);
        git(&repo, &["config", "user.name", "CI"]);
        std::fs::create_dir_all(repo.join("local-chains")).unwrap();
        std::fs::write(repo.join("local-chains/genesis.json"), "{\"version\": 30}\n").unwrap();
        std::fs::write(repo.join("Cargo.toml"), "[workspace]\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "init"]);
        git(&repo, &["remote", "add", "origin", remote.to_str().unwrap()]);
        git(&repo, &["push", "-q", "-u", "origin", "main"]);

        Self { temp, repo, remote }
    }

    pub async fn workspace(&self, name: &str) -> Workspace {
        Workspace::acquire(self.temp.path().join(name), false, WorkspaceMode::Fresh)
            .await
            .unwrap()
    }

    pub fn binding(&self) -> RunBinding {
        RunBinding {
            subject: Subject::new("zksync-os-server", "v31.0"),
            params: [("PROTOCOL_VERSION".to_string(), "v31.0".to_string())]
                .into_iter()
                .collect(),
            repositories: RepositorySet::new(vec![RepositoryHandle::new(
                "server",
                &self.repo,
                TouchedPaths::new(&["local-chains/**"]).unwrap(),
            )]),
            tools: Vec::new(),
        }
    }

    pub fn head(&self) -> String {
        git(&self.repo, &["rev-parse", "HEAD"])
    }

    pub fn commit_count(&self) -> usize {
        git(&self.repo, &["rev-list", "--count", "HEAD"]).parse().unwrap()
    }
}

pub fn pipeline(yaml_steps: &str) -> Pipeline {
    let yaml = format!(
        r#"
name: update-server
subject: {{ tag: zksync-os-server, version: "{{param.PROTOCOL_VERSION}}" }}
params:
  PROTOCOL_VERSION: {{}}
repositories:
  - id: server
    touched_paths: ["local-chains/**"]
steps:
{}
"#,
        yaml_steps
    );
    let pipeline = Pipeline::from_yaml(&yaml).unwrap();
    pipeline.validate().unwrap();
    pipeline
}
