use std::path::PathBuf;
use thiserror::Error;
use warden_daemon::errors::GuardianError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Cannot determine the state directory; set WARDEN_HOME")]
    NoStateDir,

    #[error("Cannot find the warden-daemon binary")]
    DaemonNotFound,

    #[error("Standalone service did not report a live PID within {0} seconds")]
    DaemonStartTimeout(u64),

    #[error("Failed to start warden-daemon at {path}: {source}")]
    DaemonSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read identity file {path}: {reason}")]
    IdentityFile { path: PathBuf, reason: String },

    #[error("No target identity: pass --generate, --identity FILE or --field NAME=VALUE")]
    NoTarget,

    #[error("PID {0} could not be confirmed alive; not signalling it")]
    Unconfirmed(u32),

    #[error(transparent)]
    Guardian(#[from] GuardianError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
