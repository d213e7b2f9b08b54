use std::path::PathBuf;
use thiserror::Error;

use crate::identity::IdentityField;
use crate::session::RunMode;

#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("Storage unavailable at '{path}': {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config '{path}': {reason}")]
    MalformedConfig { path: PathBuf, reason: String },

    #[error("Process query failed for PID {pid}: {reason}")]
    ProcessQueryFailed { pid: u32, reason: String },

    #[error("Invalid value for {field}: '{value}'")]
    InvalidIdentity { field: IdentityField, value: String },

    #[error("Unknown identity field: {0}")]
    UnknownField(String),

    #[error("Target identity must name at least one field")]
    EmptyIdentity,

    #[error("A {0} session is already running")]
    SessionActive(RunMode),

    #[error("Session config not found: {0}")]
    NoSessionConfig(PathBuf),

    #[error("File watcher error: {0}")]
    Watcher(String),

    #[error("Invalid settings in '{path}': {reason}")]
    Settings { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardianError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GuardianError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a transient storage condition the run loop should
    /// log and retry on its next cycle.
    pub fn is_storage(&self) -> bool {
        matches!(self, GuardianError::StorageUnavailable { .. })
    }
}

impl From<notify::Error> for GuardianError {
    fn from(e: notify::Error) -> Self {
        GuardianError::Watcher(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GuardianError>;
