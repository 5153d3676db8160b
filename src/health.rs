//! Pre-flight checks for groupmirror
//!
//! Verifies the external tools and inputs a mirror run depends on before any
//! work starts. Errors abort the run; warnings are only reported.

use std::path::Path;
use std::process::Command;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Access token presence
    pub token: CheckResult,
    /// Local root status
    pub local_root: CheckResult,
    /// Git credential store (warning only, not required)
    pub credentials: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(token: Option<&str>, local_root: &Path) -> Self {
        Self {
            git: Self::check_git(),
            token: Self::check_token(token),
            local_root: Self::check_local_root(local_root),
            credentials: Self::check_credentials(),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.git.passed && self.token.passed && self.local_root.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    pub fn check_git() -> CheckResult {
        match Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_token(token: Option<&str>) -> CheckResult {
        match token.map(str::trim) {
            Some(token) if !token.is_empty() => CheckResult::ok("Access token provided"),
            _ => CheckResult::error_with_details(
                "No access token",
                "Pass --token or set GITLAB_TOKEN",
            ),
        }
    }

    /// The local root must be a writable directory, or creatable below an existing one
    fn check_local_root(local_root: &Path) -> CheckResult {
        if local_root.exists() {
            return match std::fs::metadata(local_root) {
                Ok(meta) if !meta.is_dir() => CheckResult::error_with_details(
                    "Local root is not a directory",
                    local_root.display().to_string(),
                ),
                Ok(meta) if meta.permissions().readonly() => CheckResult::error_with_details(
                    "Local root is read-only",
                    local_root.display().to_string(),
                ),
                Ok(_) => CheckResult::ok_with_details("Local root exists", local_root.display().to_string()),
                Err(e) => CheckResult::error_with_details("Cannot inspect local root", e.to_string()),
            };
        }

        match local_root.ancestors().skip(1).find(|p| p.exists()) {
            Some(ancestor) if ancestor.is_dir() => CheckResult::ok_with_details(
                "Local root will be created",
                local_root.display().to_string(),
            ),
            _ => CheckResult::error_with_details(
                "Local root cannot be created",
                local_root.display().to_string(),
            ),
        }
    }

    /// Check that git has somewhere to get HTTP credentials from (warning only)
    fn check_credentials() -> CheckResult {
        let store = dirs::home_dir().unwrap_or_default().join(".git-credentials");
        if store.exists() {
            return CheckResult::ok_with_details("Git credential store found", store.display().to_string());
        }

        let helper = Command::new("git")
            .args(["config", "--get", "credential.helper"])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
            .filter(|helper| !helper.is_empty());

        match helper {
            Some(helper) => CheckResult::ok_with_details("Git credential helper configured", helper),
            None => CheckResult::warning_with_details(
                "No git credentials configured",
                "Cloning private projects over HTTPS may fail. Configure credential.helper or ~/.git-credentials",
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Access Token", &self.token),
            ("Local Root", &self.local_root),
            ("Git Credentials", &self.credentials),
        ]
    }
}
