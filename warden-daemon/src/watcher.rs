//! Change notifications for the directory holding the primary file.
//!
//! A native notify watcher feeds the event queue; a periodic rescan compares
//! modification times and fills in anything the native back-end dropped.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{GuardianError, Result};

/// Kind of change observed for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A raw filesystem change, before debouncing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// True when synthesized by the polling fallback
    pub polled: bool,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            polled: false,
        }
    }
}

/// Watches one directory (non-recursively) with native notifications plus a
/// polling rescan that keeps events flowing when native delivery drops them.
///
/// Releases its native handle and cancels the rescan on [`Watcher::stop`] or drop.
pub struct Watcher {
    directory: PathBuf,
    native: Option<RecommendedWatcher>,
    poll_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("directory", &self.directory)
            .field("native", &self.native.is_some())
            .field("polling", &self.poll_task.is_some())
            .finish()
    }
}

impl Watcher {
    /// Start watching `directory`, sending events to `events`.
    ///
    /// The directory is created if missing. When native notifications cannot
    /// be attached the watcher runs on polling alone. Must be called within a
    /// tokio runtime.
    pub fn start(directory: &Path, poll_interval: Duration, events: mpsc::Sender<WatchEvent>) -> Result<Self> {
        std::fs::create_dir_all(directory).map_err(|e| {
            GuardianError::Watcher(format!("cannot create {}: {}", directory.display(), e))
        })?;

        let native = match attach_native(directory, events.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(
                    "Native file notifications unavailable for {:?} ({}), relying on polling every {:?}",
                    directory, e, poll_interval
                );
                None
            }
        };

        let poll_task = tokio::spawn(poll_loop(directory.to_path_buf(), poll_interval, events));

        info!(
            "Watching {:?} (native: {}, poll interval: {:?})",
            directory,
            native.is_some(),
            poll_interval
        );

        Ok(Self {
            directory: directory.to_path_buf(),
            native,
            poll_task: Some(poll_task),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.native.is_some() || self.poll_task.is_some()
    }

    /// Detach from the directory. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        if self.native.take().is_some() {
            debug!("Released native watch on {:?}", self.directory);
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn attach_native(directory: &Path, events: mpsc::Sender<WatchEvent>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in translate(&event) {
                // the polling rescan recovers anything dropped here
                if let Err(mpsc::error::TrySendError::Full(change)) = events.try_send(change) {
                    warn!("Watch event queue full, dropping event for {:?}", change.path);
                }
            }
        }
        Err(error) => {
            warn!("File watcher error: {:?}", error);
        }
    })?;
    watcher.watch(directory, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Map a native notification onto created/modified/deleted changes.
pub(crate) fn translate(event: &Event) -> Vec<WatchEvent> {
    let single = |kind| {
        event
            .paths
            .iter()
            .map(|path| WatchEvent::new(path.clone(), kind))
            .collect::<Vec<_>>()
    };

    match event.kind {
        EventKind::Create(_) => single(ChangeKind::Created),
        EventKind::Remove(_) => single(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![
                WatchEvent::new(from.clone(), ChangeKind::Deleted),
                WatchEvent::new(to.clone(), ChangeKind::Created),
            ],
            _ => single(ChangeKind::Modified),
        },
        EventKind::Modify(_) | EventKind::Any => single(ChangeKind::Modified),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

async fn poll_loop(directory: PathBuf, interval: Duration, events: mpsc::Sender<WatchEvent>) {
    let mut scanner = PollScanner::new(&directory);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately and only records the baseline
    ticker.tick().await;
    scanner.scan();

    loop {
        ticker.tick().await;
        for change in scanner.scan() {
            if events.send(change).await.is_err() {
                debug!("Watch event channel closed, stopping poller for {:?}", directory);
                return;
            }
        }
    }
}

/// Tracks entry mtimes between rescans.
pub(crate) struct PollScanner {
    directory: PathBuf,
    seen: HashMap<PathBuf, SystemTime>,
}

impl PollScanner {
    pub(crate) fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            seen: HashMap::new(),
        }
    }

    /// Rescan the directory. Paths that are new or whose mtime advanced yield
    /// `Modified`; paths that vanished yield `Deleted`.
    pub(crate) fn scan(&mut self) -> Vec<WatchEvent> {
        let mut current = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    current.insert(entry.path(), modified);
                }
            }
        }

        let mut changes: Vec<WatchEvent> = current
            .iter()
            .filter(|(path, mtime)| self.seen.get(*path).is_none_or(|previous| *mtime > previous))
            .map(|(path, _)| WatchEvent {
                path: path.clone(),
                kind: ChangeKind::Modified,
                polled: true,
            })
            .collect();
        changes.extend(
            self.seen
                .keys()
                .filter(|path| !current.contains_key(*path))
                .map(|path| WatchEvent {
                    path: path.clone(),
                    kind: ChangeKind::Deleted,
                    polled: true,
                }),
        );
        changes.sort_by(|a, b| a.path.cmp(&b.path));

        self.seen = current;
        changes
    }
}
