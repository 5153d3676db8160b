use anyhow::{anyhow, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use groupmirror::mirror::{local_path, GroupStatus};
use groupmirror::{Config, EndpointRouter, HealthCheck, MirrorEngine, MirrorOptions, ProjectOutcome, TracingLog};

#[derive(Parser)]
#[command(name = "groupmirror")]
#[command(about = "Mirror every project of one or more GitLab groups into a local directory tree")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// GitLab access token
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Directory receiving the mirrored projects (overrides local_root)
    #[arg(long, global = true)]
    local_root: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or reconcile every project of the given groups
    Sync {
        /// Skip the token/API reachability check before listing
        #[arg(long)]
        skip_connectivity_check: bool,

        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Group paths, e.g. team/alpha
        #[arg(required = true)]
        groups: Vec<String>,
    },

    /// List the projects of the given groups without cloning anything
    List {
        /// Skip the token/API reachability check before listing
        #[arg(long)]
        skip_connectivity_check: bool,

        /// Group paths, e.g. team/alpha
        #[arg(required = true)]
        groups: Vec<String>,
    },

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(local_root) = &cli.local_root {
        config.local_root = local_root.clone();
        config.expand_paths()?;
    }

    init_logging(cli.verbose, &config)?;
    info!("Starting groupmirror v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Sync {
            skip_connectivity_check,
            report,
            groups,
        } => {
            let token = require_token(cli.token);
            cmd_sync(config, token, skip_connectivity_check, report, groups).await
        }
        Commands::List {
            skip_connectivity_check,
            groups,
        } => {
            let token = require_token(cli.token);
            cmd_list(config, token, skip_connectivity_check, groups).await
        }
        Commands::Doctor => cmd_doctor(&config, cli.token.as_deref()),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let default_level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(config.logging.color).with_target(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// A missing token is a usage error, reported the same way clap reports missing arguments
fn require_token(token: Option<String>) -> String {
    match token.filter(|t| !t.trim().is_empty()) {
        Some(token) => token,
        None => Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "an access token is required: pass --token or set GITLAB_TOKEN",
            )
            .exit(),
    }
}

/// Abort before any work when a required check fails
fn preflight(token: &str, config: &Config) -> Result<()> {
    let health = HealthCheck::run(Some(token), &config.local_root_path());

    for warning in health.warnings() {
        println!("⚠️  {}", warning.message);
        if let Some(details) = &warning.details {
            println!("   {}", details);
        }
    }

    if !health.all_passed() {
        print_health_report(&health);
        return Err(anyhow!("Pre-flight checks failed"));
    }

    Ok(())
}

fn build_engine(config: Config, token: String, skip_connectivity_check: bool) -> Result<MirrorEngine> {
    let options = MirrorOptions {
        token,
        local_root: config.local_root_path(),
        skip_connectivity_check,
    };
    MirrorEngine::new(config, options, Arc::new(TracingLog))
}

/// Mirror the given groups
async fn cmd_sync(
    config: Config,
    token: String,
    skip_connectivity_check: bool,
    report_path: Option<PathBuf>,
    groups: Vec<String>,
) -> Result<()> {
    preflight(&token, &config)?;

    let engine = build_engine(config, token, skip_connectivity_check)?;
    let report = engine.run(&groups).await;

    println!("\n🎉 Mirror Complete!");
    for group in &report.groups {
        match &group.status {
            GroupStatus::Completed => println!(
                "   📁 {}: {} cloned, {} updated, {} skipped, {} failed",
                group.group, group.counts.cloned, group.counts.updated, group.counts.skipped, group.counts.failed
            ),
            GroupStatus::Abandoned { reason } => {
                println!("   ⛔ {}: abandoned ({})", group.group, reason)
            }
        }
    }
    println!("   📥 Cloned: {}", report.totals.cloned);
    println!("   🔄 Updated: {}", report.totals.updated);
    println!("   ⏭️  Skipped: {}", report.totals.skipped);
    println!("   ❌ Failed: {}", report.totals.failed);
    println!("   ⏱️  Duration: {:.2}s", report.duration_secs);

    if report.totals.failed > 0 {
        println!("\n🔍 Failed Projects:");
        for group in &report.groups {
            for project in &group.projects {
                if let ProjectOutcome::Failed { error } = &project.outcome {
                    println!("   ❌ {}: {}", project.path_with_namespace, error);
                }
            }
        }
    }

    if let Some(path) = report_path {
        report.write_json(&path)?;
        println!("\n📝 Report written to {}", path.display());
    }

    Ok(())
}

/// List the projects that a sync would handle
async fn cmd_list(config: Config, token: String, skip_connectivity_check: bool, groups: Vec<String>) -> Result<()> {
    preflight(&token, &config)?;

    let local_root = config.local_root_path();
    let engine = build_engine(config, token, skip_connectivity_check)?;

    for (group, listing) in engine.list(&groups).await {
        match listing {
            Ok(projects) => {
                println!("{} ({} projects):", group, projects.len());
                for project in projects {
                    let marker = match local_path(&local_root, &project.path_with_namespace) {
                        Ok(target) if target.join(".git").exists() => "🔄",
                        Ok(_) => "📥",
                        Err(_) => "⏭️ ",
                    };
                    println!("  {} {}", marker, project.path_with_namespace);
                }
            }
            Err(e) => println!("{}: ❌ {:#}", group, e),
        }
    }

    Ok(())
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config, token: Option<&str>) -> Result<()> {
    let health = HealthCheck::run(token, &config.local_root_path());
    print_health_report(&health);

    println!();
    match EndpointRouter::from_config(config) {
        Ok(router) => {
            println!("GitLab API endpoints:");
            for endpoint in router.endpoints() {
                println!("  🌐 {}", endpoint);
            }
        }
        Err(e) => println!("❌ Invalid endpoint routing: {:#}", e),
    }

    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    use groupmirror::health::CheckResult;

    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 groupmirror System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
