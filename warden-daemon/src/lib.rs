//! Identity guardian library.
//!
//! Keeps a target identity pinned inside a JSON configuration file owned by
//! another application, either from the standalone `warden-daemon` service or
//! from a session embedded in the controller.

use std::path::{Path, PathBuf};

pub mod config_store;
pub mod enforcer;
pub mod ephemeral;
pub mod errors;
pub mod events;
pub mod identity;
pub mod persistence;
pub mod process;
pub mod session;
pub mod settings;
pub mod stats;
pub mod status;
pub mod watcher;

const GLOBAL_STATE_DIR: &str = ".warden";
const STATE_DIR_ENV: &str = "WARDEN_HOME";

/// Locations of everything warden keeps on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WardenPaths {
    state_dir: PathBuf,
}

impl WardenPaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// `$WARDEN_HOME`, else `~/.warden`. `None` when no home directory can be found.
    pub fn from_env() -> Option<Self> {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Some(Self::new(dir));
        }
        dirs::home_dir().map(|home| Self::new(home.join(GLOBAL_STATE_DIR)))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.state_dir.join("warden.yaml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("warden.pid")
    }

    pub fn session_config_file(&self) -> PathBuf {
        self.state_dir.join("session.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("warden.log")
    }

    pub fn default_target_file(&self) -> PathBuf {
        self.state_dir.join("target").join("config.json")
    }
}
