mod commands;
mod errors;
mod target;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::{Commands, TargetArgs};
use crate::errors::{CliError, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use warden_daemon::WardenPaths;
use warden_daemon::identity::TargetIdentity;
use warden_daemon::persistence::{PidMarker, SessionConfig, SessionPersistence};
use warden_daemon::process::{Liveness, SystemProcessController};
use warden_daemon::session::{GuardianSession, RunMode, SessionMode};
use warden_daemon::settings::Settings;
use warden_daemon::status::{
    Finding, ReconciliationReport, StatusReconciler, StatusSnapshot, StopOutcome, SyncOutcome, spawn_status_monitor,
};

const DAEMON_BINARY: &str = "warden-daemon";
const START_TIMEOUT_SECS: u64 = 5;

/// Warden - pins identity fields inside an externally owned JSON config
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (default: <state dir>/warden.yaml)
    #[arg(long, global = true, env = "WARDEN_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // generate needs neither settings nor a state directory
    if let Commands::Generate { fields } = &cli.command {
        let identity = target::generate(fields)?;
        println!("{}", serde_json::to_string_pretty(&identity)?);
        return Ok(());
    }

    let ctx = Context::load(cli.settings)?;

    match cli.command {
        Commands::Start {
            in_process: true,
            target,
            ..
        } => start_in_process(&ctx, &target).await,
        Commands::Start { target, .. } => start_standalone(&ctx, &target).await,
        Commands::Stop => stop_standalone(&ctx).await.map(|_| ()),
        Commands::Restart => {
            stop_standalone(&ctx).await?;
            start_standalone(&ctx, &TargetArgs::default()).await
        }
        Commands::Status { json } => {
            let snapshot = ctx.reconciler().compute_status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }
            Ok(())
        }
        Commands::Sync { json } => {
            let outcome = ctx.reconciler().sync().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_sync(&outcome);
            }
            Ok(())
        }
        Commands::Generate { .. } => Ok(()),
    }
}

/// Paths and settings shared by every command.
struct Context {
    paths: WardenPaths,
    settings: Settings,
    settings_override: Option<PathBuf>,
}

impl Context {
    fn load(settings_override: Option<PathBuf>) -> Result<Self> {
        let paths = WardenPaths::from_env().ok_or(CliError::NoStateDir)?;
        let settings = Settings::load(settings_override.as_deref(), &paths)?;
        Ok(Self {
            paths,
            settings,
            settings_override,
        })
    }

    fn reconciler(&self) -> StatusReconciler {
        StatusReconciler::new(
            &self.settings,
            &self.paths,
            Arc::new(SystemProcessController::new(&self.settings.process_name)),
        )
    }

    fn persistence(&self) -> SessionPersistence {
        SessionPersistence::new(self.paths.clone())
    }
}

async fn start_standalone(ctx: &Context, target_args: &TargetArgs) -> Result<()> {
    let reconciler = ctx.reconciler();
    let persistence = ctx.persistence();

    if let PidMarker::Pid(pid) = persistence.read_pid()?
        && reconciler.liveness(pid).await == Liveness::Alive
    {
        println!("Standalone service is already running (pid {})", pid);
        return Ok(());
    }

    match target::resolve_target(target_args)? {
        Some(target) => {
            let config = SessionConfig::new(target, Some(ctx.settings.target_file.clone()));
            persistence.save_session(&config)?;
        }
        None => {
            if persistence.load_session()?.is_none() {
                return Err(CliError::NoTarget);
            }
        }
    }

    std::fs::create_dir_all(ctx.paths.state_dir())?;
    let daemon_path = which_daemon()?;
    start_daemon_detached(&daemon_path, ctx.settings_override.as_deref())?;

    for _ in 0..START_TIMEOUT_SECS * 10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let PidMarker::Pid(pid) = persistence.read_pid()?
            && reconciler.liveness(pid).await == Liveness::Alive
        {
            println!("{} (pid {})", "Standalone service started".green(), pid);
            return Ok(());
        }
    }
    Err(CliError::DaemonStartTimeout(START_TIMEOUT_SECS))
}

async fn start_in_process(ctx: &Context, target_args: &TargetArgs) -> Result<()> {
    let target = target::resolve_target(target_args)?.ok_or(CliError::NoTarget)?;
    let mut session = GuardianSession::start(target, RunMode::InProcess, &ctx.settings, &ctx.paths).await?;

    let reconciler = Arc::new(ctx.reconciler());
    reconciler.attach_in_process(session.handle());
    let (monitor, mut updates) = spawn_status_monitor(reconciler, ctx.settings.status_interval);

    println!(
        "Guarding {} in-process. Press Ctrl+C to stop",
        ctx.settings.target_file.display()
    );

    let mut last_summary = String::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = session.wait() => {
                println!("{}", "In-process guardian was stopped by reconciliation".yellow());
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary = updates.borrow().as_ref().map(StatusSnapshot::summary);
                if let Some(summary) = summary
                    && summary != last_summary
                {
                    println!("{}", summary);
                    last_summary = summary;
                }
            }
        }
    }

    monitor.abort();
    let stats = session.get_stats();
    session.stop().await;
    println!(
        "Stopped after {}: {} corrective write(s), {} interception(s), {} backup(s) removed",
        format_uptime(stats.started_at),
        stats.corrective_writes,
        stats.interceptions,
        stats.backups_removed
    );
    Ok(())
}

async fn stop_standalone(ctx: &Context) -> Result<StopOutcome> {
    let outcome = ctx.reconciler().stop_standalone().await?;
    match outcome {
        StopOutcome::Terminated(pid) => println!("Stopped standalone service (pid {})", pid),
        StopOutcome::NotRunning => println!("Standalone service is not running"),
        StopOutcome::Unconfirmed(pid) => return Err(CliError::Unconfirmed(pid)),
    }
    Ok(outcome)
}

fn which_daemon() -> Result<PathBuf> {
    // 1. Same directory as current executable
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let daemon_path = dir.join(DAEMON_BINARY);
        if daemon_path.exists() {
            debug!("Found daemon next to the CLI: {:?}", daemon_path);
            return Ok(daemon_path);
        }
    }

    // 2. In PATH
    if let Ok(path) = which::which(DAEMON_BINARY) {
        debug!("Found daemon in PATH: {:?}", path);
        return Ok(path);
    }

    // 3. Development build
    for profile in ["debug", "release"] {
        let dev_path = PathBuf::from("target").join(profile).join(DAEMON_BINARY);
        if dev_path.exists() {
            debug!("Using development build: {:?}", dev_path);
            return Ok(dev_path);
        }
    }

    Err(CliError::DaemonNotFound)
}

fn start_daemon_detached(daemon_path: &Path, settings: Option<&Path>) -> Result<()> {
    use std::process::Command;

    let mut cmd = Command::new(daemon_path);
    cmd.arg("--resume");
    if let Some(settings) = settings {
        cmd.arg("--settings").arg(settings);
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    debug!("Spawning {:?} --resume", daemon_path);
    let child = cmd.spawn().map_err(|source| CliError::DaemonSpawn {
        path: daemon_path.to_path_buf(),
        source,
    })?;
    info!("Spawned standalone service (pid {})", child.id());

    Ok(())
}

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "SESSION")]
    session: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "UPTIME")]
    uptime: String,
    #[tabled(rename = "TARGET")]
    target: String,
}

fn session_rows(snapshot: &StatusSnapshot) -> Vec<SessionRow> {
    let standalone = &snapshot.standalone;
    let in_process = &snapshot.in_process;
    let dash = || "-".to_string();
    vec![
        SessionRow {
            session: "standalone".to_string(),
            state: standalone.state.to_string(),
            pid: match standalone.marker {
                PidMarker::Pid(pid) => pid.to_string(),
                PidMarker::Unreadable => "?".to_string(),
                PidMarker::Absent => dash(),
            },
            uptime: match (&standalone.session, standalone.state.is_running()) {
                (Some(session), true) => format_uptime(session.started_at),
                _ => dash(),
            },
            target: standalone
                .session
                .as_ref()
                .map(|s| format_target(&s.target))
                .unwrap_or_else(dash),
        },
        SessionRow {
            session: "in-process".to_string(),
            state: if in_process.paused {
                format!("{} (paused)", in_process.state)
            } else {
                in_process.state.to_string()
            },
            pid: dash(),
            uptime: dash(),
            target: in_process.target.as_ref().map(format_target).unwrap_or_else(dash),
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Problem,
    Warning,
    Idle,
    Healthy,
}

/// Hard issues outrank warnings, which outrank an idle report.
fn summary_tone(report: &ReconciliationReport) -> Tone {
    if !report.consistent {
        Tone::Problem
    } else if !report.warnings.is_empty() {
        Tone::Warning
    } else if report.mode == SessionMode::None {
        Tone::Idle
    } else {
        Tone::Healthy
    }
}

fn print_status(snapshot: &StatusSnapshot) {
    let summary = snapshot.summary();
    let summary = match summary_tone(&snapshot.report) {
        Tone::Problem => summary.red(),
        Tone::Warning => summary.yellow(),
        Tone::Idle => summary.normal(),
        Tone::Healthy => summary.green(),
    };
    println!("{}", summary);
    println!();

    let table = Table::new(session_rows(snapshot)).with(Style::blank()).to_string();
    println!("{table}");

    let protection = &snapshot.protection;
    println!();
    println!(
        "Config: {}",
        match protection.last_modified {
            Some(modified) => format!("present, modified {} ago", format_uptime(modified)),
            None if protection.config_present => "present".to_string(),
            None => "absent".to_string(),
        }
    );
    println!("Score:  {}/100", snapshot.report.score);

    print_findings("Issues", &snapshot.report.issues, true);
    print_findings("Warnings", &snapshot.report.warnings, false);

    if !snapshot.recent_log.is_empty() {
        println!();
        println!("Recent activity:");
        for line in &snapshot.recent_log {
            println!("  {}", line.dimmed());
        }
    }
}

fn print_findings(title: &str, findings: &[Finding], hard: bool) {
    if findings.is_empty() {
        return;
    }
    println!();
    println!("{}:", title);
    for finding in findings {
        let kind = if hard {
            finding.kind.as_str().red()
        } else {
            finding.kind.as_str().yellow()
        };
        println!("  {}: {}", kind, finding.detail);
    }
}

fn print_sync(outcome: &SyncOutcome) {
    if outcome.actions.is_empty() {
        println!("Nothing to correct");
    }
    for action in &outcome.actions {
        let mark = if action.succeeded { "ok".green() } else { "failed".red() };
        println!("[{}] {}: {} ({})", mark, action.kind, action.action, action.detail);
    }
    println!(
        "Score {} -> {}: {}",
        outcome.before.report.score,
        outcome.after.report.score,
        outcome.after.summary()
    );
}

/// `primaryId=7c9e6679…, sessionId=9f86d081…`
fn format_target(target: &TargetIdentity) -> String {
    target
        .iter()
        .map(|(field, value)| {
            let short: String = value.chars().take(8).collect();
            if short.len() < value.len() {
                format!("{}={}…", field, short)
            } else {
                format!("{}={}", field, value)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_uptime(since: DateTime<Utc>) -> String {
    let secs = (Utc::now() - since).num_seconds().max(0);

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests;
