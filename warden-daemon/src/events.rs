//! Merge step between the watcher and the enforcer.
//!
//! Raw events arriving within one debounce window are coalesced per path and
//! ordered so ephemeral files are handled before the primary file they are
//! about to overwrite.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::ephemeral::{EphemeralMatcher, PathRole};
use crate::watcher::{ChangeKind, WatchEvent};

/// One logical change for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub role: PathRole,
    pub kind: ChangeKind,
}

/// Changes to dispatch together, backups first, then in-progress files, then
/// the primary file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    /// Raw events folded into this batch
    pub raw_events: usize,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn touches_primary(&self) -> bool {
        self.changes.iter().any(|c| c.role == PathRole::Primary)
    }
}

#[derive(Debug)]
pub struct EventCoalescer<'a> {
    matcher: &'a EphemeralMatcher,
    pending: HashMap<PathBuf, (PathRole, ChangeKind)>,
    raw_events: usize,
}

impl<'a> EventCoalescer<'a> {
    pub fn new(matcher: &'a EphemeralMatcher) -> Self {
        Self {
            matcher,
            pending: HashMap::new(),
            raw_events: 0,
        }
    }

    /// Fold one raw event in. Unrelated paths are dropped.
    pub fn push(&mut self, event: WatchEvent) {
        let role = self.matcher.classify(&event.path);
        if role == PathRole::Unrelated {
            return;
        }
        self.raw_events += 1;
        let kind = match self.pending.get(&event.path) {
            Some((_, previous)) => merge_kind(*previous, event.kind),
            None => event.kind,
        };
        self.pending.insert(event.path, (role, kind));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finish(self) -> ChangeBatch {
        let mut changes: Vec<Change> = self
            .pending
            .into_iter()
            .map(|(path, (role, kind))| Change { path, role, kind })
            .collect();
        changes.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.path.cmp(&b.path)));
        ChangeBatch {
            changes,
            raw_events: self.raw_events,
        }
    }
}

/// Latest kind wins, except that a path created within the window stays
/// `Created` until it is deleted again.
fn merge_kind(previous: ChangeKind, next: ChangeKind) -> ChangeKind {
    match (previous, next) {
        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
        (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
        (ChangeKind::Deleted, ChangeKind::Created) => ChangeKind::Modified,
        (_, next) => next,
    }
}

/// Starting from `first`, keep receiving until `window` has elapsed and return
/// the merged batch. The window is fixed from the first event, so a steady
/// stream of events cannot postpone dispatch indefinitely.
pub async fn collect_window(
    matcher: &EphemeralMatcher,
    first: WatchEvent,
    rx: &mut mpsc::Receiver<WatchEvent>,
    window: Duration,
) -> ChangeBatch {
    let mut coalescer = EventCoalescer::new(matcher);
    coalescer.push(first);
    let deadline = Instant::now() + window;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            next = rx.recv() => match next {
                Some(event) => coalescer.push(event),
                None => break,
            },
        }
    }

    coalescer.finish()
}

#[cfg(test)]
mod tests;
