use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;

const ORIGIN_REFS: &str = "refs/remotes/origin/";

/// Git operations handler for mirrored checkouts
#[derive(Debug, Clone)]
pub struct GitClient {
    operation_timeout: Duration,
    clone_timeout: Duration,
    stash_message: String,
    fallback_branches: Vec<String>,
}

/// Ways of finding the remote default branch, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStrategy {
    /// `git remote show origin` (asks the remote)
    RemoteShow,
    /// The cached `refs/remotes/origin/HEAD` symbolic ref
    SymbolicRef,
    /// First existing remote-tracking branch among the fallback names
    CommonNames,
    /// Whatever is checked out locally
    CurrentBranch,
}

impl BranchStrategy {
    pub const ORDER: [BranchStrategy; 4] = [
        BranchStrategy::RemoteShow,
        BranchStrategy::SymbolicRef,
        BranchStrategy::CommonNames,
        BranchStrategy::CurrentBranch,
    ];
}

/// What reset-to-default did to an existing clone
#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub branch: String,
    pub source: BranchStrategy,
    pub stashed: bool,
    pub fetched: bool,
    /// False when `reset --hard origin/<branch>` failed
    pub reset_applied: bool,
    /// Best-effort steps that failed
    pub warnings: Vec<String>,
}

/// What an update (fetch all + pull) did
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub fetched: bool,
    pub warnings: Vec<String>,
}

impl GitClient {
    /// Create a new Git client with the given configuration
    pub fn new(config: &Config) -> Self {
        Self {
            operation_timeout: config.timeouts.git_operation(),
            clone_timeout: config.timeouts.clone_timeout(),
            stash_message: config.mirror.stash_message.clone(),
            fallback_branches: config.mirror.fallback_branches.clone(),
        }
    }

    /// A directory holding a `.git` marker
    pub fn is_repository(path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Clone `url` into `target`; a failed attempt removes the directory it created
    pub async fn clone(&self, url: &str, target: &Path) -> Result<()> {
        let preexisting = target.exists();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent directory {}", parent.display()))?;
        }

        let target_arg = target.to_string_lossy();
        let result = self
            .run_checked(None, &["clone", "--quiet", url, target_arg.as_ref()], self.clone_timeout)
            .await;

        if let Err(e) = result {
            let e = e.context(format!("Git clone of {} failed", url));
            if !preexisting && target.exists() {
                if let Err(cleanup) = tokio::fs::remove_dir_all(target).await {
                    return Err(e.context(format!(
                        "partial clone left at {}: {}",
                        target.display(),
                        cleanup
                    )));
                }
            }
            return Err(e);
        }

        Ok(())
    }

    /// Reconcile an existing clone with the remote default branch.
    ///
    /// Only failing to name a branch is an error; stash, fetch, checkout and
    /// the final hard reset are best-effort and reported as warnings.
    pub async fn reset_to_default(&self, path: &Path) -> Result<ResetOutcome> {
        let mut warnings = Vec::new();

        let mut stashed = false;
        match self.has_uncommitted_changes(path).await {
            Ok(true) => match self.stash(path).await {
                Ok(()) => stashed = true,
                Err(e) => warnings.push(format!("stash failed: {:#}", e)),
            },
            Ok(false) => {}
            Err(e) => warnings.push(format!("could not inspect working tree: {:#}", e)),
        }

        let fetched = match self.fetch_origin(path).await {
            Ok(()) => true,
            Err(e) => {
                warnings.push(format!("fetch from origin failed, continuing with stale refs: {:#}", e));
                false
            }
        };

        let (branch, source) = self
            .detect_default_branch(path)
            .await
            .ok_or_else(|| anyhow!("Could not determine default branch of {}", path.display()))?;

        if let Err(e) = self.checkout(path, &branch).await {
            warnings.push(format!("checkout of {} failed: {:#}", branch, e));
        }

        let reset_target = format!("origin/{}", branch);
        let reset_applied = match self.reset_hard(path, &reset_target).await {
            Ok(()) => true,
            Err(e) => {
                warnings.push(format!("reset to {} failed: {:#}", reset_target, e));
                false
            }
        };

        Ok(ResetOutcome {
            branch,
            source,
            stashed,
            fetched,
            reset_applied,
            warnings,
        })
    }

    /// Fetch every remote, then pull the current branch. Only the pull is fatal.
    pub async fn update(&self, path: &Path) -> Result<UpdateOutcome> {
        let mut warnings = Vec::new();

        let fetched = match self.run_checked(Some(path), &["fetch", "--all", "--quiet"], self.operation_timeout).await {
            Ok(_) => true,
            Err(e) => {
                warnings.push(format!("fetch --all failed: {:#}", e));
                false
            }
        };

        self.run_checked(Some(path), &["pull", "--quiet"], self.operation_timeout)
            .await
            .context("Git pull failed")?;

        Ok(UpdateOutcome { fetched, warnings })
    }

    /// Evaluate [`BranchStrategy::ORDER`]; the first strategy yielding a name wins
    pub async fn detect_default_branch(&self, path: &Path) -> Option<(String, BranchStrategy)> {
        for strategy in BranchStrategy::ORDER {
            if let Some(branch) = self.try_strategy(path, strategy).await {
                debug!("Default branch of {} is {} (via {:?})", path.display(), branch, strategy);
                return Some((branch, strategy));
            }
        }
        None
    }

    async fn try_strategy(&self, path: &Path, strategy: BranchStrategy) -> Option<String> {
        match strategy {
            BranchStrategy::RemoteShow => {
                let stdout = self
                    .run_checked(Some(path), &["remote", "show", "origin"], self.operation_timeout)
                    .await
                    .ok()?;
                parse_remote_head_branch(&stdout)
            }
            BranchStrategy::SymbolicRef => {
                let stdout = self
                    .run_checked(
                        Some(path),
                        &["symbolic-ref", "--quiet", "refs/remotes/origin/HEAD"],
                        self.operation_timeout,
                    )
                    .await
                    .ok()?;
                non_empty(stdout.strip_prefix(ORIGIN_REFS)?)
            }
            BranchStrategy::CommonNames => {
                for name in &self.fallback_branches {
                    let reference = format!("{}{}", ORIGIN_REFS, name);
                    let exists = self
                        .run_checked(
                            Some(path),
                            &["show-ref", "--verify", "--quiet", reference.as_str()],
                            self.operation_timeout,
                        )
                        .await
                        .is_ok();
                    if exists {
                        return Some(name.clone());
                    }
                }
                None
            }
            BranchStrategy::CurrentBranch => self.current_branch(path).await.ok().flatten(),
        }
    }

    /// Checked-out branch name; `None` on a detached HEAD
    pub async fn current_branch(&self, path: &Path) -> Result<Option<String>> {
        let stdout = self
            .run_checked(Some(path), &["rev-parse", "--abbrev-ref", "HEAD"], self.operation_timeout)
            .await?;

        Ok(match stdout.as_str() {
            "" | "HEAD" => None,
            branch => Some(branch.to_string()),
        })
    }

    /// Modified or staged tracked files; untracked files are left alone by stash and reset
    pub async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool> {
        let stdout = self
            .run_checked(
                Some(path),
                &["status", "--porcelain", "--untracked-files=no"],
                self.operation_timeout,
            )
            .await
            .context("Failed to check git status")?;

        Ok(!stdout.is_empty())
    }

    pub async fn stash(&self, path: &Path) -> Result<()> {
        self.run_checked(
            Some(path),
            &["stash", "push", "-m", self.stash_message.as_str()],
            self.operation_timeout,
        )
        .await
        .context("Git stash failed")?;
        Ok(())
    }

    pub async fn fetch_origin(&self, path: &Path) -> Result<()> {
        self.run_checked(Some(path), &["fetch", "--quiet", "origin"], self.operation_timeout)
            .await
            .context("Git fetch failed")?;
        Ok(())
    }

    pub async fn checkout(&self, path: &Path, branch: &str) -> Result<()> {
        self.run_checked(Some(path), &["checkout", "--quiet", branch], self.operation_timeout)
            .await
            .context("Git checkout failed")?;
        Ok(())
    }

    pub async fn reset_hard(&self, path: &Path, target: &str) -> Result<()> {
        self.run_checked(Some(path), &["reset", "--hard", "--quiet", target], self.operation_timeout)
            .await
            .context("Git reset failed")?;
        Ok(())
    }

    /// Run git, returning trimmed stdout; non-zero exit becomes an error carrying stderr
    async fn run_checked(&self, dir: Option<&Path>, args: &[&str], limit: Duration) -> Result<String> {
        let output = self.run(dir, args, limit).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str], limit: Duration) -> Result<Output> {
        let mut command = AsyncCommand::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        debug!("git {}", args.join(" "));

        match timeout(limit, command.output()).await {
            Ok(output) => output.with_context(|| format!("Failed to execute git {}", args.join(" "))),
            Err(_) => Err(anyhow!(
                "git {} timed out after {}s",
                args.first().copied().unwrap_or_default(),
                limit.as_secs()
            )),
        }
    }
}

/// Extract `HEAD branch: <name>` from `git remote show` output
fn parse_remote_head_branch(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(str::trim)
        .filter(|branch| *branch != "(unknown)")
        .and_then(non_empty)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> String {
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

    /// Bare repository at `<root>/remote.git` whose default branch is `main`,
    /// plus the `<root>/seed` working copy it was created from
    fn bare_remote(root: &Path) -> PathBuf {
        let seed = root.join("seed");
        fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-q"]);
        git(&seed, &["checkout", "-q", "-b", "main"]);
        fs::write(seed.join("README.md"), "hello\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-q", "-m", "initial"]);
        git(root, &["clone", "-q", "--bare", "seed", "remote.git"]);
        root.join("remote.git")
    }

    fn push_new_commit(root: &Path, file: &str) {
        let seed = root.join("seed");
        fs::write(seed.join(file), "more\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-q", "-m", file]);
        git(&seed, &["push", "-q", "../remote.git", "main"]);
    }

    fn local_clone(root: &Path, remote: &Path, name: &str) -> PathBuf {
        git(root, &["clone", "-q", remote.to_str().unwrap(), name]);
        let path = root.join(name);
        git(&path, &["config", "user.name", "Test"]);
        git(&path, &["config", "user.email", "test@example.com"]);
        path
    }

    fn client() -> GitClient {
        let mut config = Config::default();
        config.timeouts.git_operation = 30;
        config.timeouts.clone = 60;
        GitClient::new(&config)
    }

    #[test]
    fn test_parse_remote_head_branch() {
        let output = "* remote origin\n  Fetch URL: /tmp/r.git\n  HEAD branch: main\n  Remote branch:\n    main tracked\n";
        assert_eq!(parse_remote_head_branch(output), Some("main".to_string()));
        assert_eq!(parse_remote_head_branch("  HEAD branch: (unknown)\n"), None);
        assert_eq!(parse_remote_head_branch("  HEAD branch: \n"), None);
        assert_eq!(parse_remote_head_branch("* remote origin\n"), None);
    }

    #[test]
    fn test_strategy_order() {
        assert_eq!(BranchStrategy::ORDER[0], BranchStrategy::RemoteShow);
        assert_eq!(BranchStrategy::ORDER[3], BranchStrategy::CurrentBranch);
    }

    #[tokio::test]
    async fn test_clone_and_detect_via_remote() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let target = tmp.path().join("mirror/team/svc");

        client().clone(remote.to_str().unwrap(), &target).await.unwrap();

        assert!(GitClient::is_repository(&target));
        let (branch, source) = client().detect_default_branch(&target).await.unwrap();
        assert_eq!(branch, "main");
        assert_eq!(source, BranchStrategy::RemoteShow);
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("team/missing");

        let result = client()
            .clone(tmp.path().join("nope.git").to_str().unwrap(), &target)
            .await;

        assert!(result.is_err());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_failed_clone_keeps_directory_it_did_not_create() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("team/busy");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.txt"), "someone else's\n").unwrap();

        let result = client()
            .clone(tmp.path().join("remote.git").to_str().unwrap(), &target)
            .await;

        assert!(result.is_err());
        assert!(target.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_symbolic_ref() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        git(&path, &["remote", "set-url", "origin", "/nonexistent/remote.git"]);

        let (branch, source) = client().detect_default_branch(&path).await.unwrap();
        assert_eq!(branch, "main");
        assert_eq!(source, BranchStrategy::SymbolicRef);
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_common_names() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        git(&path, &["remote", "set-url", "origin", "/nonexistent/remote.git"]);
        git(&path, &["remote", "set-head", "origin", "--delete"]);
        git(&path, &["checkout", "-q", "-b", "feature-x"]);

        let (branch, source) = client().detect_default_branch(&path).await.unwrap();
        assert_eq!(branch, "main");
        assert_eq!(source, BranchStrategy::CommonNames);
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_current_branch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("standalone");
        fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "-q"]);
        git(&path, &["checkout", "-q", "-b", "trunk"]);
        fs::write(path.join("a.txt"), "a\n").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-q", "-m", "a"]);

        let (branch, source) = client().detect_default_branch(&path).await.unwrap();
        assert_eq!(branch, "trunk");
        assert_eq!(source, BranchStrategy::CurrentBranch);
    }

    #[tokio::test]
    async fn test_reset_fails_without_any_branch_name() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("detached");
        fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "-q"]);
        fs::write(path.join("a.txt"), "a\n").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-q", "-m", "a"]);
        git(&path, &["checkout", "-q", "--detach"]);

        assert!(client().reset_to_default(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_moves_feature_branch_with_edits_to_main() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        git(&path, &["checkout", "-q", "-b", "feature-x"]);
        fs::write(path.join("README.md"), "local edit\n").unwrap();
        push_new_commit(tmp.path(), "CHANGELOG.md");

        let outcome = client().reset_to_default(&path).await.unwrap();

        assert_eq!(outcome.branch, "main");
        assert!(outcome.stashed);
        assert!(outcome.fetched);
        assert!(outcome.reset_applied);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
        assert_eq!(git(&path, &["rev-parse", "HEAD"]), git(&path, &["rev-parse", "origin/main"]));
        assert!(path.join("CHANGELOG.md").exists());
        assert!(git(&path, &["stash", "list"]).contains("auto-stash before reset"));
    }

    #[tokio::test]
    async fn test_untracked_files_are_not_stashed() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        fs::write(path.join("scratch.txt"), "notes\n").unwrap();

        assert!(!client().has_uncommitted_changes(&path).await.unwrap());

        let outcome = client().reset_to_default(&path).await.unwrap();

        assert!(!outcome.stashed);
        assert!(outcome.reset_applied);
        assert_eq!(git(&path, &["stash", "list"]), "");
        assert!(path.join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn test_reset_is_idempotent_on_clean_clone() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        let head = git(&path, &["rev-parse", "HEAD"]);

        for _ in 0..2 {
            let outcome = client().reset_to_default(&path).await.unwrap();
            assert!(!outcome.stashed);
            assert!(outcome.reset_applied);
        }

        assert_eq!(git(&path, &["rev-parse", "HEAD"]), head);
        assert_eq!(git(&path, &["stash", "list"]), "");
    }

    #[tokio::test]
    async fn test_reset_with_unreachable_origin_still_succeeds() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        git(&path, &["remote", "set-url", "origin", "/nonexistent/remote.git"]);
        git(&path, &["update-ref", "-d", "refs/remotes/origin/main"]);
        git(&path, &["symbolic-ref", "refs/remotes/origin/HEAD", "refs/remotes/origin/main"]);

        let outcome = client().reset_to_default(&path).await.unwrap();

        assert_eq!(outcome.branch, "main");
        assert_eq!(outcome.source, BranchStrategy::SymbolicRef);
        assert!(!outcome.fetched);
        assert!(!outcome.reset_applied);
        assert_eq!(outcome.warnings.len(), 2);

        // The follow-up update cannot pull either
        assert!(client().update(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_update_pulls_new_commits() {
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(tmp.path());
        let path = local_clone(tmp.path(), &remote, "work");
        push_new_commit(tmp.path(), "NEWS.md");

        let outcome = client().update(&path).await.unwrap();

        assert!(outcome.fetched);
        assert!(path.join("NEWS.md").exists());
    }
}
