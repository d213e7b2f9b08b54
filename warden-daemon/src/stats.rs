use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals of corrective actions, shared between a session and its enforcer.
#[derive(Debug)]
pub struct SessionStats {
    started_at: DateTime<Utc>,
    interceptions: AtomicU64,
    corrective_writes: AtomicU64,
    backups_removed: AtomicU64,
    events_seen: AtomicU64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            interceptions: AtomicU64::new(0),
            corrective_writes: AtomicU64::new(0),
            backups_removed: AtomicU64::new(0),
            events_seen: AtomicU64::new(0),
        }
    }

    pub fn record_interception(&self) {
        self.interceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrective_write(&self) {
        self.corrective_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backup_removed(&self) {
        self.backups_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events(&self, count: usize) {
        self.events_seen.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self, is_protected: bool) -> StatsSnapshot {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        StatsSnapshot {
            started_at: self.started_at,
            uptime_secs: uptime.num_seconds().max(0) as u64,
            interceptions: self.interceptions.load(Ordering::Relaxed),
            corrective_writes: self.corrective_writes.load(Ordering::Relaxed),
            backups_removed: self.backups_removed.load(Ordering::Relaxed),
            events_seen: self.events_seen.load(Ordering::Relaxed),
            is_protected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    /// Ephemeral files inspected and neutralized
    pub interceptions: u64,
    /// Writes to the primary config that restored the target identity
    pub corrective_writes: u64,
    pub backups_removed: u64,
    pub events_seen: u64,
    /// Whether the primary config carried the target identity when sampled
    pub is_protected: bool,
}
