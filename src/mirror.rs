//! Mirror engine - mirrors GitLab groups into a local directory tree
//!
//! One task is spawned per requested group; inside a group, projects are
//! handled strictly in listing order. Each task keeps its own counters and the
//! reports are reduced into a single [`MirrorReport`] once every task joined.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use path_clean::PathClean;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Add, AddAssign};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::Config;
use crate::git::GitClient;
use crate::gitlab::{AccessProbe, GitLabClient, ProjectEntry};
use crate::log::MirrorLog;
use crate::routing::{Endpoint, EndpointRouter};

/// Run-wide inputs that do not come from the configuration file
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub token: String,
    pub local_root: PathBuf,
    pub skip_connectivity_check: bool,
}

/// What happened to one listed project
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProjectOutcome {
    Cloned,
    /// Existing clone reset to `branch` and pulled
    Updated { branch: String },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectResult {
    pub path_with_namespace: String,
    #[serde(flatten)]
    pub outcome: ProjectOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub cloned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: &ProjectOutcome) {
        match outcome {
            ProjectOutcome::Cloned => self.cloned += 1,
            ProjectOutcome::Updated { .. } => self.updated += 1,
            ProjectOutcome::Skipped { .. } => self.skipped += 1,
            ProjectOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.cloned + self.updated
    }

    pub fn total(&self) -> usize {
        self.cloned + self.updated + self.skipped + self.failed
    }
}

impl Add for OutcomeCounts {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cloned: self.cloned + other.cloned,
            updated: self.updated + other.updated,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }
}

impl AddAssign for OutcomeCounts {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Completed,
    /// Connectivity, authentication or listing failed; no project was touched
    Abandoned { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group: String,
    pub endpoint: String,
    #[serde(flatten)]
    pub status: GroupStatus,
    pub counts: OutcomeCounts,
    pub projects: Vec<ProjectResult>,
}

impl GroupReport {
    fn completed(group: &str, endpoint: &Endpoint, projects: Vec<ProjectResult>) -> Self {
        let mut counts = OutcomeCounts::default();
        for project in &projects {
            counts.record(&project.outcome);
        }

        Self {
            group: group.to_string(),
            endpoint: endpoint.to_string(),
            status: GroupStatus::Completed,
            counts,
            projects,
        }
    }

    fn abandoned(group: &str, endpoint: &Endpoint, reason: String) -> Self {
        Self {
            group: group.to_string(),
            endpoint: endpoint.to_string(),
            status: GroupStatus::Abandoned { reason },
            counts: OutcomeCounts::default(),
            projects: Vec::new(),
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.status, GroupStatus::Abandoned { .. })
    }

    pub fn outcome_of(&self, path_with_namespace: &str) -> Option<&ProjectOutcome> {
        self.projects
            .iter()
            .find(|p| p.path_with_namespace == path_with_namespace)
            .map(|p| &p.outcome)
    }
}

/// Results from a complete mirror run
#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub totals: OutcomeCounts,
    pub groups: Vec<GroupReport>,
}

impl MirrorReport {
    fn compile(started_at: DateTime<Utc>, start: Instant, groups: Vec<GroupReport>) -> Self {
        let totals = groups
            .iter()
            .map(|g| g.counts)
            .fold(OutcomeCounts::default(), |acc, counts| acc + counts);

        Self {
            started_at,
            duration_secs: start.elapsed().as_secs_f64(),
            totals,
            groups,
        }
    }

    pub fn abandoned_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.is_abandoned()).count()
    }

    pub fn group(&self, group: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group == group)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write report: {}", path.display()))
    }
}

/// Map `path_with_namespace` below `root`, refusing anything that would escape it
pub fn local_path(root: &Path, path_with_namespace: &str) -> Result<PathBuf> {
    let relative = Path::new(path_with_namespace).clean();

    let contained = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));

    if path_with_namespace.trim().is_empty() || !contained || relative == Path::new(".") {
        return Err(anyhow!("Refusing unsafe project path: {:?}", path_with_namespace));
    }

    Ok(root.join(relative))
}

/// Group paths deduplicated in first-seen order, surrounding slashes removed
fn normalize_groups(groups: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for group in groups {
        let group = group.trim().trim_matches('/');
        if !group.is_empty() && !seen.iter().any(|g: &String| g == group) {
            seen.push(group.to_string());
        }
    }
    seen
}

/// A requested ancestor on the same endpoint already lists every project of `group`
fn covering_group<'a>(group: &str, groups: &'a [String], router: &EndpointRouter) -> Option<&'a String> {
    groups.iter().find(|other| {
        group.len() > other.len()
            && group.starts_with(other.as_str())
            && group.as_bytes()[other.len()] == b'/'
            && router.resolve(other) == router.resolve(group)
    })
}

/// Local paths taken by a group task during one run
#[derive(Debug, Default)]
struct ProjectClaims {
    owners: Mutex<HashMap<PathBuf, String>>,
}

impl ProjectClaims {
    /// Claim `target` for `group`; returns the owning group when another task got there first
    fn claim(&self, target: &Path, group: &str) -> std::result::Result<(), String> {
        let mut owners = match self.owners.lock() {
            Ok(owners) => owners,
            Err(poisoned) => poisoned.into_inner(),
        };
        match owners.get(target) {
            Some(owner) if owner != group => Err(owner.clone()),
            Some(_) => Ok(()),
            None => {
                owners.insert(target.to_path_buf(), group.to_string());
                Ok(())
            }
        }
    }
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    if tokio::fs::symlink_metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// The orchestrator: turns group paths into a populated local tree
#[derive(Clone)]
pub struct MirrorEngine {
    config: Arc<Config>,
    router: Arc<EndpointRouter>,
    git: GitClient,
    options: Arc<MirrorOptions>,
    log: Arc<dyn MirrorLog>,
}

impl MirrorEngine {
    pub fn new(config: Config, options: MirrorOptions, log: Arc<dyn MirrorLog>) -> Result<Self> {
        let router = EndpointRouter::from_config(&config).context("Invalid endpoint routing")?;
        let git = GitClient::new(&config);

        Ok(Self {
            config: Arc::new(config),
            router: Arc::new(router),
            git,
            options: Arc::new(options),
            log,
        })
    }

    /// Mirror every group concurrently and report once all of them finished
    pub async fn run(&self, groups: &[String]) -> MirrorReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let requested = normalize_groups(groups);

        let mut groups = Vec::with_capacity(requested.len());
        for group in &requested {
            match covering_group(group, &requested, &self.router) {
                Some(ancestor) => self.log.info(&format!(
                    "[{}] included in {}, not mirrored separately",
                    group, ancestor
                )),
                None => groups.push(group.clone()),
            }
        }

        self.log.info(&format!(
            "Mirroring {} group(s) into {}",
            groups.len(),
            self.options.local_root.display()
        ));

        let claims = Arc::new(ProjectClaims::default());
        let mut tasks = FuturesUnordered::new();
        for (index, group) in groups.iter().enumerate() {
            let engine = self.clone();
            let task_group = group.clone();
            let claims = Arc::clone(&claims);
            let handle = tokio::spawn(async move { engine.mirror_group(&task_group, &claims).await });
            tasks.push(async move { (index, handle.await) });
        }

        let mut reports = Vec::with_capacity(groups.len());
        while let Some((index, joined)) = tasks.next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    let group = &groups[index];
                    self.log.error(&format!("[{}] group task failed: {}", group, e));
                    GroupReport::abandoned(group, self.router.resolve(group), format!("group task failed: {}", e))
                }
            };
            reports.push((index, report));
        }
        reports.sort_by_key(|(index, _)| *index);

        let report = MirrorReport::compile(
            started_at,
            start,
            reports.into_iter().map(|(_, report)| report).collect(),
        );

        self.log.info(&format!(
            "Mirror finished in {:.2}s: {} cloned, {} updated, {} skipped, {} failed, {} group(s) abandoned",
            report.duration_secs,
            report.totals.cloned,
            report.totals.updated,
            report.totals.skipped,
            report.totals.failed,
            report.abandoned_groups()
        ));

        report
    }

    /// List the projects of each group without touching the filesystem
    pub async fn list(&self, groups: &[String]) -> Vec<(String, Result<Vec<ProjectEntry>>)> {
        let mut listings = Vec::new();

        for group in normalize_groups(groups) {
            let listing = match self.connect(&group).await {
                Ok(client) => client.list_group_projects(&group).await,
                Err(e) => Err(e),
            };
            listings.push((group, listing));
        }

        listings
    }

    /// Client for the group's endpoint, with the connectivity check applied
    async fn connect(&self, group: &str) -> Result<GitLabClient> {
        let endpoint = self.router.resolve(group).clone();
        let client = GitLabClient::new(endpoint, &self.options.token, &self.config)?;

        if self.options.skip_connectivity_check {
            return Ok(client);
        }

        match client.validate_token().await {
            Ok(user) => self.log.debug(&format!(
                "[{}] token of {} accepted by {}",
                group,
                user.username,
                client.endpoint()
            )),
            Err(e) => {
                self.log.error(&format!("[{}] connectivity check failed: {:#}", group, e));
                let diagnosis = client.diagnose_host().await;
                self.log.warn(&format!("[{}] {}", group, diagnosis.summary()));
                return Err(e.context("Connectivity check failed"));
            }
        }

        Ok(client)
    }

    async fn mirror_group(&self, group: &str, claims: &ProjectClaims) -> GroupReport {
        let endpoint = self.router.resolve(group).clone();
        self.log.info(&format!("[{}] using API {}", group, endpoint));

        let client = match self.connect(group).await {
            Ok(client) => client,
            Err(e) => {
                self.log.error(&format!("[{}] skipping group", group));
                return GroupReport::abandoned(group, &endpoint, format!("{:#}", e));
            }
        };

        let projects = match client.list_group_projects(group).await {
            Ok(projects) => projects,
            Err(e) => {
                self.log.error(&format!("[{}] could not list projects: {:#}", group, e));
                return GroupReport::abandoned(group, &endpoint, format!("{:#}", e));
            }
        };

        self.log.info(&format!("[{}] {} project(s) listed", group, projects.len()));

        let mut results = Vec::with_capacity(projects.len());
        for project in &projects {
            let outcome = self.mirror_project(&client, group, project, claims).await;
            results.push(ProjectResult {
                path_with_namespace: project.path_with_namespace.clone(),
                outcome,
            });
        }

        let report = GroupReport::completed(group, &endpoint, results);
        self.log.info(&format!(
            "[{}] done: {} cloned, {} updated, {} skipped, {} failed",
            group, report.counts.cloned, report.counts.updated, report.counts.skipped, report.counts.failed
        ));
        report
    }

    async fn mirror_project(
        &self,
        client: &GitLabClient,
        group: &str,
        project: &ProjectEntry,
        claims: &ProjectClaims,
    ) -> ProjectOutcome {
        let name = project.path_with_namespace.as_str();

        let Some(url) = project.http_url_to_repo.as_deref().filter(|u| !u.is_empty()) else {
            self.log.warn(&format!("[{}] {} has no HTTP clone URL, skipping", group, name));
            return ProjectOutcome::Skipped {
                reason: "no http_url_to_repo in listing".to_string(),
            };
        };

        let target = match local_path(&self.options.local_root, name) {
            Ok(target) => target,
            Err(e) => {
                self.log.warn(&format!("[{}] {:#}", group, e));
                return ProjectOutcome::Skipped { reason: e.to_string() };
            }
        };

        if let Err(owner) = claims.claim(&target, group) {
            self.log.info(&format!("[{}] {} already handled by group {}, skipping", group, name, owner));
            return ProjectOutcome::Skipped {
                reason: format!("already mirrored by group {}", owner),
            };
        }

        if !target.exists() {
            match client.probe_project_access(name).await {
                AccessProbe::Accessible => {}
                AccessProbe::Denied(status) => {
                    self.log.warn(&format!("[{}] {} not accessible (HTTP {}), skipping", group, name, status));
                    return ProjectOutcome::Skipped {
                        reason: format!("access probe returned HTTP {}", status),
                    };
                }
                AccessProbe::Inconclusive(reason) => {
                    self.log.warn(&format!(
                        "[{}] access probe for {} inconclusive ({}), continuing",
                        group, name, reason
                    ));
                }
            }
        } else if !GitClient::is_repository(&target) {
            self.log.warn(&format!(
                "[{}] {} exists but is not a git repository, removing",
                group,
                target.display()
            ));
            if let Err(e) = remove_path(&target).await {
                return self.failed(group, name, format!("could not remove {}: {}", target.display(), e));
            }
        } else {
            match self.git.reset_to_default(&target).await {
                Ok(reset) => {
                    if reset.stashed {
                        self.log.info(&format!("[{}] {}: stashed local changes", group, name));
                    }
                    for warning in &reset.warnings {
                        self.log.warn(&format!("[{}] {}: {}", group, name, warning));
                    }
                    return self.update(group, name, &target, reset.branch).await;
                }
                Err(e) => {
                    self.log.warn(&format!("[{}] {}: {:#}; recloning", group, name, e));
                    if let Err(e) = remove_path(&target).await {
                        return self.failed(group, name, format!("could not remove {}: {}", target.display(), e));
                    }
                }
            }
        }

        self.log.info(&format!("[{}] cloning {}", group, name));
        match self.git.clone(url, &target).await {
            Ok(()) => {
                self.log.success(&format!("[{}] cloned {}", group, name));
                ProjectOutcome::Cloned
            }
            Err(e) => self.failed(group, name, format!("{:#}", e)),
        }
    }

    async fn update(&self, group: &str, name: &str, target: &Path, branch: String) -> ProjectOutcome {
        match self.git.update(target).await {
            Ok(update) => {
                for warning in &update.warnings {
                    self.log.warn(&format!("[{}] {}: {}", group, name, warning));
                }
                self.log.success(&format!("[{}] updated {} on {}", group, name, branch));
                ProjectOutcome::Updated { branch }
            }
            Err(e) => self.failed(group, name, format!("{:#}", e)),
        }
    }

    fn failed(&self, group: &str, name: &str, error: String) -> ProjectOutcome {
        self.log.error(&format!("[{}] {} failed: {}", group, name, error));
        ProjectOutcome::Failed { error }
    }
}
