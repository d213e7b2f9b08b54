//! Temporary guarded directory with fast timings

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use warden_daemon::WardenPaths;
use warden_daemon::identity::{IdentityField, TargetIdentity};
use warden_daemon::persistence::SessionPersistence;
use warden_daemon::settings::Settings;

pub const PRIMARY_A: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
pub const PRIMARY_B: &str = "3b241101-e2bb-4255-8caf-4136c566a962";

/// A target directory holding `config.json` plus a separate state directory,
/// both inside one `TempDir` that is removed on drop.
pub struct GuardedDir {
    dir: TempDir,
    pub settings: Settings,
    pub paths: WardenPaths,
}

impl GuardedDir {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let target_dir = dir.path().join("target");
        std::fs::create_dir_all(&target_dir).expect("create target dir");
        let settings = Settings {
            debounce: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            liveness_timeout: Duration::from_millis(500),
            io_retry_delay: Duration::from_millis(20),
            ..Settings::for_target(target_dir.join("config.json"))
        };
        let paths = WardenPaths::new(dir.path().join("state"));
        Self { dir, settings, paths }
    }

    pub fn with_settings(mut self, f: impl FnOnce(&mut Settings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.target_file
    }

    /// Sibling of the primary file, e.g. `sibling(".bak")` -> `config.json.bak`.
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.config_path().as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn write_config(&self, value: &Value) {
        write_json(self.config_path(), value);
    }

    pub fn read_config(&self) -> Option<Map<String, Value>> {
        read_json(self.config_path())
    }

    /// String value of `key` in the primary file.
    pub fn field(&self, key: &str) -> Option<String> {
        self.read_config()?.get(key)?.as_str().map(str::to_string)
    }

    pub fn persistence(&self) -> SessionPersistence {
        SessionPersistence::new(self.paths.clone())
    }
}

impl Default for GuardedDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity pinning only `primaryId`.
pub fn primary_identity(value: &str) -> TargetIdentity {
    TargetIdentity::new([(IdentityField::PrimaryId, value)]).expect("valid primary id")
}

pub fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_string_pretty(value).expect("serialize json")).expect("write json");
}

pub fn read_json(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
