//! Common test utilities and helpers for groupmirror tests

#![allow(dead_code)]

use groupmirror::{Config, MemoryLog, MirrorEngine, MirrorOptions};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "glpat-test-token";

/// Run git in `dir` with a fixed identity, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Scratch area holding bare "remote" repositories and the mirror root
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub remotes: PathBuf,
    pub local_root: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remotes = temp_dir.path().join("remotes");
        let local_root = temp_dir.path().join("mirror");
        fs::create_dir_all(&remotes).expect("Failed to create remotes dir");

        Self {
            temp_dir,
            remotes,
            local_root,
        }
    }

    fn seed_dir(&self, name: &str) -> PathBuf {
        self.remotes.join(format!("{}-seed", name))
    }

    /// Create a bare repository `<name>.git` with one commit on `main`; returns its path
    pub fn create_remote(&self, name: &str) -> String {
        let seed = self.seed_dir(name);
        fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-q"]);
        git(&seed, &["checkout", "-q", "-b", "main"]);
        fs::write(seed.join("README.md"), format!("# {}\n", name)).unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-q", "-m", "initial"]);

        let bare = self.remotes.join(format!("{}.git", name));
        git(
            &self.remotes,
            &["clone", "-q", "--bare", seed.to_str().unwrap(), bare.to_str().unwrap()],
        );
        bare.to_string_lossy().into_owned()
    }

    /// Commit a new file in the seed and push it to the bare remote
    pub fn push_commit(&self, name: &str, file: &str) {
        let seed = self.seed_dir(name);
        fs::write(seed.join(file), "change\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-q", "-m", file]);
        let bare = self.remotes.join(format!("{}.git", name));
        git(&seed, &["push", "-q", bare.to_str().unwrap(), "main"]);
    }

    /// Clone `remote` to `<local_root>/<path_with_namespace>` with a local identity
    pub fn existing_clone(&self, remote: &str, path_with_namespace: &str) -> PathBuf {
        let target = self.local_root.join(path_with_namespace);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        git(
            self.temp_dir.path(),
            &["clone", "-q", remote, target.to_str().unwrap()],
        );
        git(&target, &["config", "user.name", "Test"]);
        git(&target, &["config", "user.email", "test@example.com"]);
        target
    }

    pub fn config(&self, api_url: &str) -> Config {
        let mut config = Config::default();
        config.local_root = self.local_root.to_string_lossy().into_owned();
        config.gitlab.api_url = api_url.to_string();
        config.timeouts.connect = 2;
        config.timeouts.request = 5;
        config.timeouts.clone = 60;
        config.timeouts.git_operation = 30;
        config
    }

    pub fn engine(&self, config: Config, skip_connectivity_check: bool) -> (MirrorEngine, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let options = MirrorOptions {
            token: TOKEN.to_string(),
            local_root: self.local_root.clone(),
            skip_connectivity_check,
        };
        let engine = MirrorEngine::new(config, options, log.clone()).expect("Failed to build engine");
        (engine, log)
    }
}

pub fn api_url(server: &MockServer) -> String {
    format!("{}/api/v4", server.uri())
}

/// `/api/v4/projects/team%2Falpha%2Fsvc`
pub fn project_api_path(path_with_namespace: &str) -> String {
    format!("/api/v4/projects/{}", path_with_namespace.replace('/', "%2F"))
}

pub async fn mount_user(server: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/api/v4/user"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({"username": "mirror-bot"})))
        .mount(server)
        .await;
}

/// Single-page listing of `(path_with_namespace, http_url_to_repo)` entries
pub async fn mount_group(server: &MockServer, group: &str, projects: &[(&str, Option<&str>)]) {
    let body: Vec<_> = projects
        .iter()
        .map(|(path, url)| json!({"path_with_namespace": path, "http_url_to_repo": url}))
        .collect();

    Mock::given(method("GET"))
        .and(path(format!("/api/v4/groups/{}/projects", group.replace('/', "%2F"))))
        .and(query_param("include_subgroups", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn mount_project(server: &MockServer, path_with_namespace: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(project_api_path(path_with_namespace)))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

pub fn head_of(repo: &Path) -> String {
    git(repo, &["rev-parse", "HEAD"])
}

pub fn branch_of(repo: &Path) -> String {
    git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}
