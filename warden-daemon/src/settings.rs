//! Runtime settings, read from an optional `warden.yaml`.

pub mod duration;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::WardenPaths;
use crate::errors::{GuardianError, Result};
use crate::identity::IdentityField;


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Primary configuration file to guard. Relative paths resolve against the
    /// state directory; empty means `<state_dir>/target/config.json`.
    pub target_file: PathBuf,
    /// JSON key for each identity field. Fields not listed use their own name.
    pub field_keys: BTreeMap<IdentityField, String>,
    pub in_progress_suffixes: Vec<String>,
    pub backup_suffixes: Vec<String>,
    #[serde(with = "duration::debounce")]
    pub debounce: Duration,
    #[serde(with = "duration::period")]
    pub poll_interval: Duration,
    #[serde(with = "duration::period")]
    pub self_check_interval: Duration,
    #[serde(with = "duration::period")]
    pub status_interval: Duration,
    #[serde(with = "duration::liveness")]
    pub liveness_timeout: Duration,
    #[serde(with = "duration::any")]
    pub io_retry_delay: Duration,
    #[serde(with = "duration::any")]
    pub recent_activity_window: Duration,
    /// Process name of the standalone service, used for orphan detection.
    pub process_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_file: PathBuf::new(),
            field_keys: BTreeMap::new(),
            in_progress_suffixes: vec![".tmp".to_string(), ".vsctmp".to_string()],
            backup_suffixes: vec![
                ".bak".to_string(),
                ".backup".to_string(),
                ".old".to_string(),
                ".orig".to_string(),
            ],
            debounce: Duration::from_millis(150),
            poll_interval: Duration::from_secs(30),
            self_check_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(3),
            io_retry_delay: Duration::from_millis(100),
            recent_activity_window: Duration::from_secs(5 * 60),
            process_name: "warden-daemon".to_string(),
        }
    }
}

impl Settings {
    /// Defaults guarding an explicit target file.
    pub fn for_target(target_file: impl Into<PathBuf>) -> Self {
        Self {
            target_file: target_file.into(),
            ..Self::default()
        }
    }

    /// Load settings from `explicit` if given, else from the state directory's
    /// `warden.yaml`. A missing default file yields defaults; a missing explicit
    /// file is an error.
    pub fn load(explicit: Option<&Path>, paths: &WardenPaths) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.settings_file());

        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| GuardianError::storage(&path, e))?;
            debug!("Loaded settings from {:?}", path);
            serde_yaml::from_str::<Settings>(&content).map_err(|e| GuardianError::Settings {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else if explicit.is_some() {
            return Err(GuardianError::Settings {
                path,
                reason: "file does not exist".to_string(),
            });
        } else {
            Settings::default()
        };

        settings.resolve_target(paths);
        settings
            .validate()
            .map_err(|reason| GuardianError::Settings { path, reason })?;
        Ok(settings)
    }

    fn resolve_target(&mut self, paths: &WardenPaths) {
        if self.target_file.as_os_str().is_empty() {
            self.target_file = paths.default_target_file();
        } else if self.target_file.is_relative() {
            self.target_file = paths.state_dir().join(&self.target_file);
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self
            .in_progress_suffixes
            .iter()
            .chain(&self.backup_suffixes)
            .any(|s| s.is_empty())
        {
            return Err("ephemeral suffixes must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for field in IdentityField::ALL {
            let key = self.key_for(field);
            if key.is_empty() {
                return Err(format!("field_keys.{} must not be empty", field));
            }
            if !seen.insert(key) {
                return Err(format!("field_keys maps two fields to '{}'", key));
            }
        }
        Ok(())
    }

    /// JSON key under which `field` is stored in the target file.
    pub fn key_for(&self, field: IdentityField) -> &str {
        self.field_keys
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.as_str())
    }
}
