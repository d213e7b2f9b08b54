use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use warden_daemon::WardenPaths;
use warden_daemon::errors::GuardianError;
use warden_daemon::identity::TargetIdentity;
use warden_daemon::persistence::SessionPersistence;
use warden_daemon::session::{GuardianSession, RunMode};
use warden_daemon::settings::Settings;

/// Warden standalone service - keeps identity fields pinned in a JSON config
#[derive(Parser)]
#[command(name = "warden-daemon", version, about)]
struct Args {
    /// Resume the target identity persisted in session.json
    #[arg(long, conflicts_with = "fields")]
    resume: bool,

    /// Target identity field, repeatable
    #[arg(long = "field", value_name = "NAME=VALUE")]
    fields: Vec<String>,

    /// Settings file (default: <state dir>/warden.yaml)
    #[arg(long, env = "WARDEN_SETTINGS")]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let paths = WardenPaths::from_env().context("cannot determine the home directory; set WARDEN_HOME")?;
    create_state_dir(&paths)?;
    let settings = Settings::load(args.settings.as_deref(), &paths)?;

    let target = if args.resume {
        let persistence = SessionPersistence::new(paths.clone());
        persistence
            .load_session()?
            .ok_or_else(|| GuardianError::NoSessionConfig(paths.session_config_file()))?
            .target
    } else if !args.fields.is_empty() {
        TargetIdentity::from_pairs(&args.fields)?
    } else {
        bail!("nothing to enforce: pass --resume or at least one --field NAME=VALUE");
    };

    info!("Starting warden daemon (pid {})", std::process::id());
    let mut session = GuardianSession::start(target, RunMode::Standalone, &settings, &paths).await?;

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown requested"),
        _ = session.wait() => info!("Session ended"),
    }

    session.stop().await;
    info!("Daemon shutting down");
    Ok(())
}

/// State directory with owner-only permissions.
fn create_state_dir(paths: &WardenPaths) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(paths.state_dir())
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(paths.state_dir())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
