//! On-disk records of the standalone service.
//!
//! - `warden.pid`: PID marker, plain text holding one process id
//! - `session.json`: the target identity and start time, so a relaunched
//!   service resumes the same target
//! - `warden.log`: append-only action log, one line per event

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::WardenPaths;
use crate::errors::{GuardianError, Result};
use crate::identity::TargetIdentity;

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub target: TargetIdentity,
    pub started_at: DateTime<Utc>,
    /// Primary file the session guards, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<PathBuf>,
}

impl SessionConfig {
    pub fn new(target: TargetIdentity, target_file: Option<PathBuf>) -> Self {
        Self {
            target,
            started_at: Utc::now(),
            target_file,
        }
    }
}

/// State of the PID marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "pid")]
pub enum PidMarker {
    Absent,
    Pid(u32),
    /// Present but not a process id
    Unreadable,
}

impl PidMarker {
    pub fn is_present(&self) -> bool {
        !matches!(self, PidMarker::Absent)
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            PidMarker::Pid(pid) => Some(*pid),
            _ => None,
        }
    }
}

/// Reads and writes the standalone marker files inside the state directory.
#[derive(Debug, Clone)]
pub struct SessionPersistence {
    paths: WardenPaths,
}

impl SessionPersistence {
    pub fn new(paths: WardenPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &WardenPaths {
        &self.paths
    }

    // =========================================================================
    // PID marker
    // =========================================================================

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        let path = self.paths.pid_file();
        write_secure_file(&path, pid.to_string().as_bytes())?;
        debug!("Wrote PID marker {:?} ({})", path, pid);
        Ok(())
    }

    pub fn read_pid(&self) -> Result<PidMarker> {
        let path = self.paths.pid_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PidMarker::Absent),
            Err(e) => return Err(GuardianError::storage(&path, e)),
        };
        match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(PidMarker::Pid(pid)),
            _ => {
                warn!("PID marker {:?} does not hold a process id: {:?}", path, content.trim());
                Ok(PidMarker::Unreadable)
            }
        }
    }

    /// Remove the marker, but only while it still reads as `expected`, so a
    /// marker rewritten by a newer service in the meantime survives.
    pub fn remove_pid_if(&self, expected: PidMarker) -> Result<bool> {
        if expected == PidMarker::Absent || self.read_pid()? != expected {
            return Ok(false);
        }
        let path = self.paths.pid_file();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed PID marker {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GuardianError::storage(&path, e)),
        }
    }

    // =========================================================================
    // Session config
    // =========================================================================

    pub fn save_session(&self, config: &SessionConfig) -> Result<()> {
        let path = self.paths.session_config_file();
        let mut content = serde_json::to_string_pretty(config).map_err(|e| GuardianError::MalformedConfig {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        content.push('\n');
        write_secure_file(&path, content.as_bytes())?;
        debug!("Saved session config to {:?}", path);
        Ok(())
    }

    /// `Ok(None)` when no session was ever persisted. A file that exists but
    /// does not parse is an error.
    pub fn load_session(&self) -> Result<Option<SessionConfig>> {
        let path = self.paths.session_config_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GuardianError::storage(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| GuardianError::MalformedConfig {
                path,
                reason: e.to_string(),
            })
    }

    pub fn action_log(&self) -> ActionLog {
        ActionLog::new(self.paths.log_file())
    }
}

/// Append-only, human-readable log of lifecycle events and corrective actions.
#[derive(Debug, Clone)]
pub struct ActionLog {
    path: PathBuf,
}

impl ActionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<()> {
        let line = format!(
            "[{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message
        );
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuardianError::storage(parent, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GuardianError::storage(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| GuardianError::storage(&self.path, e))
    }

    /// Append, logging instead of failing.
    pub fn record(&self, message: &str) {
        if let Err(e) = self.append(message) {
            warn!("Cannot append to action log: {}", e);
        }
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
        lines[lines.len().saturating_sub(n)..]
            .iter()
            .map(|line| line.to_string())
            .collect()
    }
}

/// Write a file atomically with owner-only permissions on Unix.
fn write_secure_file(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| GuardianError::storage(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| GuardianError::storage(parent, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| GuardianError::storage(path, e))?;
    }

    tmp.write_all(content).map_err(|e| GuardianError::storage(path, e))?;
    tmp.persist(path).map_err(|e| GuardianError::storage(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests;
