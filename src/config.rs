use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for groupmirror
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root directory that receives `<path_with_namespace>` checkouts
    #[serde(default = "default_local_root")]
    pub local_root: String,

    /// GitLab API endpoints and listing settings
    #[serde(default)]
    pub gitlab: GitLabConfig,

    /// Timeouts for network calls and git subprocesses
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Reconciliation behaviour for existing clones
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitLab API configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitLabConfig {
    /// API base used when no route matches
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Ordered group-path routes; the first matching pattern wins
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Page size for project listings
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

/// A single `pattern -> api_url` routing rule
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Regular expression matched against the group path
    pub pattern: String,
    pub api_url: String,
}

/// Timeouts, in seconds
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,

    /// Upper bound for a whole API request
    #[serde(default = "default_request_timeout")]
    pub request: u64,

    #[serde(default = "default_clone_timeout")]
    pub clone: u64,

    /// Upper bound for every git invocation other than clone
    #[serde(default = "default_git_operation_timeout")]
    pub git_operation: u64,
}

/// Reset-to-default behaviour
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorConfig {
    /// Message attached to the stash created before a reset
    #[serde(default = "default_stash_message")]
    pub stash_message: String,

    /// Branch names probed when the remote HEAD cannot be read
    #[serde(default = "default_fallback_branches")]
    pub fallback_branches: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_local_root() -> String {
    "${HOME}/gitlab".to_string()
}
fn default_api_url() -> String {
    "https://gitlab.com/api/v4".to_string()
}
fn default_per_page() -> u32 {
    100
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_clone_timeout() -> u64 {
    300
}
fn default_git_operation_timeout() -> u64 {
    120
}
fn default_stash_message() -> String {
    "groupmirror: auto-stash before reset".to_string()
}
fn default_fallback_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string(), "develop".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            routes: Vec::new(),
            per_page: default_per_page(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            request: default_request_timeout(),
            clone: default_clone_timeout(),
            git_operation: default_git_operation_timeout(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            stash_message: default_stash_message(),
            fallback_branches: default_fallback_branches(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_true(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone)
    }

    pub fn git_operation(&self) -> Duration {
        Duration::from_secs(self.git_operation)
    }
}

impl Config {
    /// Load configuration from the default location, falling back to built-in defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", config_path);
            let mut config = Self::default();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("groupmirror").join("config.yml"))
    }

    /// Expand environment variables and `~` in `local_root`
    pub fn expand_paths(&mut self) -> Result<()> {
        self.local_root = shellexpand::full(&self.local_root)
            .context("Failed to expand local_root path")?
            .into_owned();

        Ok(())
    }

    pub fn local_root_path(&self) -> PathBuf {
        PathBuf::from(&self.local_root)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
            gitlab: GitLabConfig::default(),
            timeouts: TimeoutConfig::default(),
            mirror: MirrorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
