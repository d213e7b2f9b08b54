//! Asserts the target identity into the guarded file and neutralizes the
//! ephemeral siblings that could carry stale values back into it.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config_store::{ConfigStore, retry_once};
use crate::ephemeral::{EphemeralMatcher, PathRole};
use crate::errors::{GuardianError, Result};
use crate::events::{Change, ChangeBatch};
use crate::identity::{IdentityField, TargetIdentity};
use crate::settings::Settings;
use crate::stats::SessionStats;
use crate::watcher::ChangeKind;

/// A corrective action taken on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementAction {
    /// The primary file was rewritten with the target identity.
    Corrected { path: PathBuf, fields: Vec<IdentityField> },
    /// An in-progress marker was rewritten in place.
    Rewrote { path: PathBuf, fields: Vec<IdentityField> },
    /// An ephemeral file was deleted.
    Removed { path: PathBuf, role: PathRole },
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |fields: &[IdentityField]| {
            fields
                .iter()
                .map(IdentityField::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            EnforcementAction::Corrected { path, fields } => {
                write!(f, "corrected {} in {}", names(fields), path.display())
            }
            EnforcementAction::Rewrote { path, fields } => {
                write!(f, "rewrote {} in in-progress file {}", names(fields), path.display())
            }
            EnforcementAction::Removed { path, role } => match role {
                PathRole::Backup => write!(f, "removed backup {}", path.display()),
                _ => write!(f, "removed leftover {}", path.display()),
            },
        }
    }
}

/// Holds one target identity against one primary file.
///
/// Every pass takes the write lock, so corrective writes from the event loop
/// and from the periodic self-check never overlap.
#[derive(Debug)]
pub struct IdentityEnforcer {
    store: ConfigStore,
    matcher: EphemeralMatcher,
    target: TargetIdentity,
    stats: Arc<SessionStats>,
    write_lock: Mutex<()>,
}

impl IdentityEnforcer {
    pub fn new(settings: &Settings, target: TargetIdentity, stats: Arc<SessionStats>) -> Result<Self> {
        Ok(Self {
            store: ConfigStore::new(settings),
            matcher: EphemeralMatcher::new(&settings.target_file, settings)?,
            target,
            stats,
            write_lock: Mutex::new(()),
        })
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn matcher(&self) -> &EphemeralMatcher {
        &self.matcher
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Write the target identity into the primary file if any field is
    /// missing or differs. No write happens when everything already matches.
    pub fn reconcile_config(&self) -> Result<Option<EnforcementAction>> {
        let _guard = self.write_lock.lock();
        let changed = self.store.set_fields(&self.target)?;
        if changed.is_empty() {
            debug!("{:?} already carries the target identity", self.store.path());
            return Ok(None);
        }
        self.stats.record_corrective_write();
        let action = EnforcementAction::Corrected {
            path: self.store.path().to_path_buf(),
            fields: changed,
        };
        info!("{}", action);
        Ok(Some(action))
    }

    /// Neutralize one ephemeral file. Backups are deleted whatever they
    /// contain. In-progress markers whose identity fields diverge are
    /// rewritten in place so the external application finalizes the target
    /// values.
    pub fn intercept_ephemeral(&self, path: &Path, role: PathRole) -> Result<Option<EnforcementAction>> {
        let _guard = self.write_lock.lock();
        match role {
            PathRole::Backup => self.remove(path, role),
            PathRole::InProgress => self.rewrite_in_progress(path),
            PathRole::Primary | PathRole::Unrelated => Ok(None),
        }
    }

    fn rewrite_in_progress(&self, path: &Path) -> Result<Option<EnforcementAction>> {
        let Some(mut file) = self.store.read_at(path)? else {
            return Ok(None);
        };

        let keys = self.store.keys();
        let carried = keys.extract(&file.content, &self.target.field_names().collect::<Vec<_>>());
        let stale = carried
            .iter()
            .any(|(field, value)| self.target.get(*field) != Some(value.as_str()));
        if !stale {
            return Ok(None);
        }

        let fields = keys.apply(&mut file.content, &self.target);
        self.store.write_in_place(path, &file.content)?;
        self.stats.record_interception();
        let action = EnforcementAction::Rewrote {
            path: path.to_path_buf(),
            fields,
        };
        info!("{}", action);
        Ok(Some(action))
    }

    fn remove(&self, path: &Path, role: PathRole) -> Result<Option<EnforcementAction>> {
        let removed = retry_once(self.store.retry_delay(), path, || match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })?;
        if !removed {
            return Ok(None);
        }

        self.stats.record_interception();
        if role == PathRole::Backup {
            self.stats.record_backup_removed();
        }
        let action = EnforcementAction::Removed {
            path: path.to_path_buf(),
            role,
        };
        info!("{}", action);
        Ok(Some(action))
    }

    /// Route one change by the role of its path.
    pub fn on_config_changed(&self, change: &Change) -> Result<Option<EnforcementAction>> {
        match (change.role, change.kind) {
            (PathRole::Primary, _) => self.reconcile_config(),
            (role, ChangeKind::Created | ChangeKind::Modified) if role.is_ephemeral() => {
                self.intercept_ephemeral(&change.path, role)
            }
            _ => Ok(None),
        }
    }

    /// Handle a merged batch in order. Failures are logged and the remaining
    /// changes are still handled; the next cycle retries whatever failed.
    pub fn dispatch(&self, batch: &ChangeBatch) -> Vec<EnforcementAction> {
        self.stats.record_events(batch.raw_events);
        let mut actions = Vec::new();
        for change in &batch.changes {
            match self.on_config_changed(change) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) => log_failure(&change.path, &e),
            }
        }
        actions
    }

    /// Delete every ephemeral file currently present, whatever its kind.
    pub fn purge_ephemerals(&self) -> Result<Vec<EnforcementAction>> {
        let _guard = self.write_lock.lock();
        let found = self
            .matcher
            .scan()
            .map_err(|e| GuardianError::storage(self.matcher.directory(), e))?;

        let mut actions = Vec::new();
        for (path, role) in found {
            match self.remove(&path, role) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) => log_failure(&path, &e),
            }
        }
        Ok(actions)
    }

    /// Whether the primary file currently carries every target field.
    pub fn is_protected(&self) -> bool {
        match self.store.read() {
            Ok(Some(file)) => self.store.keys().diverging(&file.content, &self.target).is_empty(),
            Ok(None) => false,
            Err(e) => {
                debug!("Cannot sample {:?}: {}", self.store.path(), e);
                false
            }
        }
    }
}

fn log_failure(path: &Path, error: &GuardianError) {
    if error.is_storage() {
        warn!("{}; will retry on the next cycle", error);
    } else {
        error!("Enforcement failed for {:?}: {}", path, error);
    }
}

#[cfg(test)]
mod tests;
