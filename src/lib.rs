//! groupmirror - mirror GitLab groups into a local directory tree
//!
//! Every project reachable from the requested groups (subgroups included) is
//! cloned into `<local_root>/<path_with_namespace>`, or, when a clone already
//! exists, reset to the remote default branch and pulled.
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`routing`]: Group path to API endpoint routing
//! - [`gitlab`]: GitLab REST API client
//! - [`git`]: git subprocess operations and the reset-to-default sequence
//! - [`mirror`]: The concurrent group orchestrator and its report
//! - [`log`]: Logger capability used by the orchestrator
//! - [`health`]: Pre-flight checks

pub mod config;
pub mod git;
pub mod gitlab;
pub mod health;
pub mod log;
pub mod mirror;
pub mod routing;

pub use config::Config;
pub use git::{BranchStrategy, GitClient, ResetOutcome};
pub use gitlab::{AccessProbe, GitLabClient, ProjectEntry};
pub use health::HealthCheck;
pub use log::{LogLevel, MemoryLog, MirrorLog, TracingLog};
pub use mirror::{MirrorEngine, MirrorOptions, MirrorReport, ProjectOutcome};
pub use routing::{Endpoint, EndpointRouter};
