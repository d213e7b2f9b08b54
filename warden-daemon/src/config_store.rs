//! Typed access to the guarded JSON configuration file.
//!
//! Only the keys mapped to [`IdentityField`]s are ever touched; every other key
//! round-trips with its value and position intact.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{GuardianError, Result};
use crate::identity::{IdentityField, TargetIdentity};
use crate::settings::Settings;

/// Snapshot of a parsed JSON configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub content: Map<String, Value>,
    pub modified: Option<DateTime<Utc>>,
}

/// Resolves identity fields to JSON keys.
#[derive(Debug, Clone)]
pub struct FieldKeys {
    keys: BTreeMap<IdentityField, String>,
}

impl FieldKeys {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            keys: IdentityField::ALL
                .into_iter()
                .map(|field| (field, settings.key_for(field).to_string()))
                .collect(),
        }
    }

    pub fn key(&self, field: IdentityField) -> &str {
        self.keys
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.as_str())
    }

    /// Read the identity values present in `content`. Non-string values are
    /// reported as absent.
    pub fn extract(&self, content: &Map<String, Value>, names: &[IdentityField]) -> BTreeMap<IdentityField, String> {
        names
            .iter()
            .filter_map(|field| {
                content
                    .get(self.key(*field))
                    .and_then(Value::as_str)
                    .map(|value| (*field, value.to_string()))
            })
            .collect()
    }

    /// Fields of `target` that are missing from `content` or carry another value.
    pub fn diverging(&self, content: &Map<String, Value>, target: &TargetIdentity) -> Vec<IdentityField> {
        target
            .iter()
            .filter(|(field, wanted)| content.get(self.key(*field)).and_then(Value::as_str) != Some(*wanted))
            .map(|(field, _)| field)
            .collect()
    }

    /// Overwrite the identity keys of `content` with `target`. Keys that already
    /// exist keep their position. Returns the fields that changed.
    pub fn apply(&self, content: &mut Map<String, Value>, target: &TargetIdentity) -> Vec<IdentityField> {
        let changed = self.diverging(content, target);
        for field in &changed {
            if let Some(value) = target.get(*field) {
                content.insert(self.key(*field).to_string(), Value::String(value.to_string()));
            }
        }
        changed
    }
}

/// Read/write access to one JSON configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    keys: FieldKeys,
    retry_delay: Duration,
}

impl ConfigStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            path: settings.target_file.clone(),
            keys: FieldKeys::from_settings(settings),
            retry_delay: settings.io_retry_delay,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keys(&self) -> &FieldKeys {
        &self.keys
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Parse the primary file. `Ok(None)` when it is absent or not a JSON object.
    pub fn read(&self) -> Result<Option<ConfigFile>> {
        self.read_at(&self.path)
    }

    /// Parse any JSON object file, e.g. an ephemeral sibling of the primary file.
    pub fn read_at(&self, path: &Path) -> Result<Option<ConfigFile>> {
        let raw = retry_once(self.retry_delay, path, || match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match parse_object(&raw) {
            Ok(content) => {
                let modified = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from);
                Ok(Some(ConfigFile {
                    path: path.to_path_buf(),
                    content,
                    modified,
                }))
            }
            Err(reason) => {
                warn!(
                    "{}; treating as absent",
                    GuardianError::MalformedConfig {
                        path: path.to_path_buf(),
                        reason,
                    }
                );
                Ok(None)
            }
        }
    }

    /// Replace the primary file. Writes a sibling temp file and renames it over
    /// the target so the external reader never sees a half-written file.
    pub fn write(&self, content: &Map<String, Value>) -> Result<()> {
        let serialized = serialize(content);
        retry_once(self.retry_delay, &self.path, || write_atomic(&self.path, serialized.as_bytes()))?;
        debug!("Wrote {:?}", self.path);
        Ok(())
    }

    /// Overwrite a file in place, keeping its inode. Used for in-progress
    /// markers the external application still expects to rename itself.
    pub fn write_in_place(&self, path: &Path, content: &Map<String, Value>) -> Result<()> {
        let serialized = serialize(content);
        retry_once(self.retry_delay, path, || std::fs::write(path, serialized.as_bytes()))
    }

    pub fn get_fields(&self, names: &[IdentityField]) -> Result<BTreeMap<IdentityField, String>> {
        Ok(self
            .read()?
            .map(|file| self.keys.extract(&file.content, names))
            .unwrap_or_default())
    }

    /// Assert `values` into the primary file. Nothing is written when every
    /// field already matches. Returns the fields that were corrected.
    pub fn set_fields(&self, values: &TargetIdentity) -> Result<Vec<IdentityField>> {
        let mut content = self.read()?.map(|file| file.content).unwrap_or_default();
        let changed = self.keys.apply(&mut content, values);
        if !changed.is_empty() {
            self.write(&content)?;
        }
        Ok(changed)
    }
}

fn parse_object(raw: &str) -> std::result::Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("top-level value is not an object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn serialize(content: &Map<String, Value>) -> String {
    // a Map of Values always serializes
    let mut out = serde_json::to_string_pretty(content).unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    out
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    // leading dot keeps the temp name outside the ephemeral naming convention
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .tempfile_in(parent)?;
    if let Ok(existing) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(existing.permissions())?;
    }
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Run `op`, and once more after `delay` if it fails. A second failure
/// surfaces as [`GuardianError::StorageUnavailable`].
pub(crate) fn retry_once<T>(
    delay: Duration,
    path: &Path,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            debug!("IO on {:?} failed ({}), retrying once", path, first);
            std::thread::sleep(delay);
            op().map_err(|e| GuardianError::storage(path, e))
        }
    }
}
