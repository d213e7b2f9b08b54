//! Naming convention for ephemeral siblings of the primary config file.
//!
//! An ephemeral file is the primary file name plus a recognized suffix:
//! in-progress write markers (`config.json.tmp`) or backups
//! (`config.json.bak`, `config.json.bak.1`, `config.json.backup-20240101`).
//! Every other sibling is ignored.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{GuardianError, Result};
use crate::settings::Settings;

/// What a path in the watched directory means to the guardian.
///
/// Variant order is dispatch order within a merged batch of changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathRole {
    /// A backup copy. Destroyed on sight.
    Backup,
    /// An in-progress write the external application will finalize.
    InProgress,
    /// The guarded file itself.
    Primary,
    Unrelated,
}

impl PathRole {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, PathRole::Backup | PathRole::InProgress)
    }
}

#[derive(Debug, Clone)]
pub struct EphemeralMatcher {
    directory: PathBuf,
    canonical_directory: Option<PathBuf>,
    file_name: String,
    in_progress: GlobSet,
    backup: GlobSet,
}

impl EphemeralMatcher {
    pub fn new(primary: &Path, settings: &Settings) -> Result<Self> {
        let file_name = primary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| GuardianError::Settings {
                path: primary.to_path_buf(),
                reason: "target_file has no file name".to_string(),
            })?;
        let directory = primary
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = globset::escape(&file_name);

        let in_progress = build_set(
            settings
                .in_progress_suffixes
                .iter()
                .map(|suffix| format!("{}{}", base, globset::escape(suffix))),
        )?;
        let backup = build_set(settings.backup_suffixes.iter().flat_map(|suffix| {
            let exact = format!("{}{}", base, globset::escape(suffix));
            [exact.clone(), format!("{}.*", exact), format!("{}-*", exact)]
        }))?;

        Ok(Self {
            canonical_directory: std::fs::canonicalize(&directory).ok(),
            directory,
            file_name,
            in_progress,
            backup,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn classify(&self, path: &Path) -> PathRole {
        let in_directory = path.parent().is_some_and(|parent| {
            parent == self.directory || self.canonical_directory.as_deref() == Some(parent)
        });
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return PathRole::Unrelated;
        };
        if !in_directory {
            return PathRole::Unrelated;
        }

        if name == self.file_name {
            PathRole::Primary
        } else if self.backup.is_match(name) {
            PathRole::Backup
        } else if self.in_progress.is_match(name) {
            PathRole::InProgress
        } else {
            PathRole::Unrelated
        }
    }

    /// Ephemeral files currently present, backups first.
    pub fn scan(&self) -> std::io::Result<Vec<(PathBuf, PathRole)>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found: Vec<(PathBuf, PathRole)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| self.directory.join(entry.file_name()))
            .filter_map(|path| {
                let role = self.classify(&path);
                role.is_ephemeral().then_some((path, role))
            })
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(found)
    }
}

fn build_set(patterns: impl IntoIterator<Item = String>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(&pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                warn!("Invalid ephemeral pattern '{}': {}", pattern, e);
            }
        }
    }
    builder.build().map_err(|e| GuardianError::Watcher(e.to_string()))
}

#[cfg(test)]
mod tests;
