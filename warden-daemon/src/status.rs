//! Merged view of the standalone and in-process sessions, conflict detection,
//! and the corrective `sync` pass.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::WardenPaths;
use crate::config_store::{ConfigFile, ConfigStore};
use crate::errors::{GuardianError, Result};
use crate::identity::{IdentityField, TargetIdentity};
use crate::persistence::{PidMarker, SessionConfig, SessionPersistence};
use crate::process::{Liveness, ProcessController, query_liveness};
use crate::session::{SessionHandle, SessionMode, SessionState};
use crate::settings::Settings;

const RECENT_LOG_LINES: usize = 20;
const ISSUE_PENALTY: i32 = 30;
const WARNING_PENALTY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Issue,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    StopInProcess,
    RemovePidMarker,
}

impl fmt::Display for CorrectiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectiveAction::StopInProcess => f.write_str("stop in-process guardian"),
            CorrectiveAction::RemovePidMarker => f.write_str("remove PID marker"),
        }
    }
}

/// Conditions detected across the two sessions, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DuplicateEnforcement,
    StalePidMarker,
    OrphanedProcess,
    TargetMismatch,
    IdentityDrift,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::DuplicateEnforcement => "duplicate enforcement",
            ConflictKind::StalePidMarker => "stale PID marker",
            ConflictKind::OrphanedProcess => "orphaned process",
            ConflictKind::TargetMismatch => "target mismatch",
            ConflictKind::IdentityDrift => "identity drift",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ConflictKind::DuplicateEnforcement | ConflictKind::StalePidMarker => Severity::Issue,
            ConflictKind::OrphanedProcess | ConflictKind::TargetMismatch | ConflictKind::IdentityDrift => {
                Severity::Warning
            }
        }
    }

    /// Orphans and mismatches need an operator decision.
    pub fn corrective_action(&self) -> Option<CorrectiveAction> {
        match self {
            ConflictKind::DuplicateEnforcement => Some(CorrectiveAction::StopInProcess),
            ConflictKind::StalePidMarker => Some(CorrectiveAction::RemovePidMarker),
            ConflictKind::OrphanedProcess | ConflictKind::TargetMismatch | ConflictKind::IdentityDrift => None,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: ConflictKind,
    pub detail: String,
}

impl Finding {
    fn new(kind: ConflictKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Session that is effectively enforcing; standalone wins when both run
    pub mode: SessionMode,
    /// No hard issues; warnings alone keep a report consistent
    pub consistent: bool,
    pub issues: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub score: u8,
}

impl ReconciliationReport {
    fn new(mode: SessionMode, findings: Vec<Finding>) -> Self {
        let (issues, warnings): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|finding| finding.kind.severity() == Severity::Issue);
        let penalty = ISSUE_PENALTY * issues.len() as i32 + WARNING_PENALTY * warnings.len() as i32;
        Self {
            mode,
            consistent: issues.is_empty(),
            score: (100 - penalty).max(0) as u8,
            issues,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandaloneView {
    pub marker: PidMarker,
    /// `None` when there is no PID to query
    pub liveness: Option<Liveness>,
    pub state: SessionState,
    pub session: Option<SessionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InProcessView {
    pub state: SessionState,
    pub target: Option<TargetIdentity>,
    pub paused: bool,
}

/// Lightweight evidence that something is actually enforcing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectionSignal {
    pub config_present: bool,
    pub last_modified: Option<DateTime<Utc>>,
    /// Whether the primary file changed within the recent-activity window
    pub recently_modified: bool,
    /// Whether the primary file carries the active session's target; `None`
    /// when no session is active
    pub carries_target: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub report: ReconciliationReport,
    pub standalone: StandaloneView,
    pub in_process: InProcessView,
    pub protection: ProtectionSignal,
    /// Processes with the service's name that no PID marker accounts for
    pub orphans: Vec<u32>,
    pub recent_log: Vec<String>,
}

impl StatusSnapshot {
    /// One-line human description.
    pub fn summary(&self) -> String {
        let who = match self.report.mode {
            SessionMode::Standalone => match self.standalone.marker.pid() {
                Some(pid) => format!("standalone service running (pid {})", pid),
                None => "standalone service running".to_string(),
            },
            SessionMode::InProcess if self.in_process.paused => "in-process guardian running (paused)".to_string(),
            SessionMode::InProcess => "in-process guardian running".to_string(),
            SessionMode::None => "no guardian running".to_string(),
        };
        let warnings = self.report.warnings.len();
        let health = if self.report.consistent {
            match (self.report.mode, warnings) {
                (SessionMode::None, 0) => "nothing to report".to_string(),
                (SessionMode::None, n) => format!("{} warning(s), score {}", n, self.report.score),
                (_, 0) => "protection healthy".to_string(),
                (_, n) => format!("protection healthy, {} warning(s), score {}", n, self.report.score),
            }
        } else {
            format!(
                "{} issue(s), {} warning(s), score {}",
                self.report.issues.len(),
                warnings,
                self.report.score
            )
        };
        format!("{} - {}", who, health)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncAction {
    pub kind: ConflictKind,
    pub action: CorrectiveAction,
    pub succeeded: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub before: StatusSnapshot,
    pub after: StatusSnapshot,
    pub actions: Vec<SyncAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Terminated(u32),
    NotRunning,
    /// A PID marker exists but its process could not be confirmed alive, so
    /// nothing was signalled
    Unconfirmed(u32),
}

/// Evaluate the conflict rules over one gathered state. Pure.
pub fn evaluate(
    standalone: &StandaloneView,
    in_process: &InProcessView,
    protection: &ProtectionSignal,
    orphans: &[u32],
    process_name: &str,
) -> ReconciliationReport {
    let mut findings = Vec::new();
    let standalone_running = standalone.state.is_running();
    let in_process_running = in_process.state.is_running();

    if standalone_running && in_process_running {
        findings.push(Finding::new(
            ConflictKind::DuplicateEnforcement,
            "standalone service and in-process guardian are both running",
        ));
    }

    if standalone.marker.is_present() && !standalone_running {
        let detail = match (standalone.marker, standalone.liveness) {
            (PidMarker::Pid(pid), Some(Liveness::Unknown)) => {
                format!("liveness of PID {} could not be confirmed", pid)
            }
            (PidMarker::Pid(pid), _) => format!("PID {} is not running", pid),
            _ => "PID marker does not hold a process id".to_string(),
        };
        findings.push(Finding::new(ConflictKind::StalePidMarker, detail));
    }

    if !standalone.marker.is_present() && !orphans.is_empty() {
        let pids = orphans.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
        findings.push(Finding::new(
            ConflictKind::OrphanedProcess,
            format!("{} running without a PID marker (pid {})", process_name, pids),
        ));
    }

    if let (Some(session), Some(target)) = (&standalone.session, &in_process.target)
        && session.target != *target
    {
        let differing: Vec<&str> = IdentityField::ALL
            .into_iter()
            .filter(|field| session.target.get(*field) != target.get(*field))
            .map(|field| field.as_str())
            .collect();
        findings.push(Finding::new(
            ConflictKind::TargetMismatch,
            format!("persisted and in-process targets differ in {}", differing.join(", ")),
        ));
    }

    let mode = if standalone_running {
        SessionMode::Standalone
    } else if in_process_running {
        SessionMode::InProcess
    } else {
        SessionMode::None
    };

    if protection.carries_target == Some(false) {
        findings.push(Finding::new(
            ConflictKind::IdentityDrift,
            format!("{} session is running but the config does not carry its target", mode),
        ));
    }

    ReconciliationReport::new(mode, findings)
}

/// Gathers both sessions' state and resolves conflicts between them.
pub struct StatusReconciler {
    settings: Settings,
    persistence: SessionPersistence,
    store: ConfigStore,
    processes: Arc<dyn ProcessController>,
    in_process: RwLock<Option<SessionHandle>>,
}

impl fmt::Debug for StatusReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReconciler")
            .field("state_dir", &self.persistence.paths().state_dir())
            .field("target_file", &self.store.path())
            .field("in_process", &*self.in_process.read())
            .finish()
    }
}

impl StatusReconciler {
    pub fn new(settings: &Settings, paths: &WardenPaths, processes: Arc<dyn ProcessController>) -> Self {
        Self {
            settings: settings.clone(),
            persistence: SessionPersistence::new(paths.clone()),
            store: ConfigStore::new(settings),
            processes,
            in_process: RwLock::new(None),
        }
    }

    /// Track an in-process session alongside the standalone one.
    pub fn attach_in_process(&self, handle: SessionHandle) {
        *self.in_process.write() = Some(handle);
    }

    pub fn detach_in_process(&self) {
        *self.in_process.write() = None;
    }

    pub fn persistence(&self) -> &SessionPersistence {
        &self.persistence
    }

    pub async fn compute_status(&self) -> StatusSnapshot {
        let disk = self.sample_disk().await;
        let standalone = self.standalone_view(disk.marker, disk.session).await;
        let in_process = self.in_process_view();
        let orphans = match standalone.marker {
            PidMarker::Absent => self.find_orphans().await,
            _ => Vec::new(),
        };

        let active_target = if standalone.state.is_running() {
            standalone.session.as_ref().map(|s| &s.target)
        } else if in_process.state.is_running() {
            in_process.target.as_ref()
        } else {
            None
        };
        let protection = self.protection_signal(disk.config.as_ref(), active_target);

        let report = evaluate(
            &standalone,
            &in_process,
            &protection,
            &orphans,
            &self.settings.process_name,
        );
        StatusSnapshot {
            report,
            standalone,
            in_process,
            protection,
            orphans,
            recent_log: disk.recent_log,
        }
    }

    /// Apply every defined corrective action, then report again.
    pub async fn sync(&self) -> SyncOutcome {
        let before = self.compute_status().await;
        let mut actions = Vec::new();

        for finding in &before.report.issues {
            let Some(action) = finding.kind.corrective_action() else {
                continue;
            };
            let result = match action {
                CorrectiveAction::StopInProcess => {
                    if let Some(handle) = self.in_process.read().as_ref() {
                        handle.request_stop();
                    }
                    Ok("stopped in-process guardian, standalone service kept".to_string())
                }
                CorrectiveAction::RemovePidMarker => self
                    .persistence
                    .remove_pid_if(before.standalone.marker)
                    .map(|removed| {
                        if removed {
                            "removed stale PID marker".to_string()
                        } else {
                            "PID marker already changed".to_string()
                        }
                    }),
            };

            let (succeeded, detail) = match result {
                Ok(detail) => (true, detail),
                Err(e) => (false, e.to_string()),
            };
            info!("sync: {} -> {} ({})", finding.kind, action, detail);
            actions.push(SyncAction {
                kind: finding.kind,
                action,
                succeeded,
                detail,
            });
        }

        let after = if actions.is_empty() {
            before.clone()
        } else {
            self.compute_status().await
        };
        SyncOutcome { before, after, actions }
    }

    /// Terminate the standalone service, but only after its PID has been
    /// confirmed alive.
    pub async fn stop_standalone(&self) -> Result<StopOutcome> {
        let marker = self.persistence.read_pid()?;
        let Some(pid) = marker.pid() else {
            self.persistence.remove_pid_if(marker)?;
            return Ok(StopOutcome::NotRunning);
        };

        match self.liveness(pid).await {
            Liveness::Alive => {
                let processes = self.processes.clone();
                tokio::task::spawn_blocking(move || processes.terminate(pid))
                    .await
                    .map_err(|e| GuardianError::ProcessQueryFailed {
                        pid,
                        reason: e.to_string(),
                    })??;
                self.persistence.remove_pid_if(marker)?;
                info!("Terminated standalone service (pid {})", pid);
                Ok(StopOutcome::Terminated(pid))
            }
            Liveness::Dead => {
                self.persistence.remove_pid_if(marker)?;
                Ok(StopOutcome::NotRunning)
            }
            Liveness::Unknown => {
                warn!("Not terminating PID {}: liveness could not be confirmed", pid);
                Ok(StopOutcome::Unconfirmed(pid))
            }
        }
    }

    /// Liveness of `pid`, `Unknown` when the query outlasts `liveness_timeout`.
    pub async fn liveness(&self, pid: u32) -> Liveness {
        query_liveness(self.processes.clone(), pid, self.settings.liveness_timeout).await
    }

    /// Read every on-disk input of a status pass on the blocking pool.
    async fn sample_disk(&self) -> DiskSample {
        let persistence = self.persistence.clone();
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || DiskSample::read(&persistence, &store)).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Status sampling failed: {}", e);
                DiskSample {
                    marker: PidMarker::Unreadable,
                    session: None,
                    config: None,
                    recent_log: Vec::new(),
                }
            }
        }
    }

    async fn standalone_view(&self, marker: PidMarker, session: Option<SessionConfig>) -> StandaloneView {
        let liveness = match marker.pid() {
            Some(pid) => Some(self.liveness(pid).await),
            None => None,
        };
        let state = if liveness == Some(Liveness::Alive) {
            SessionState::Running
        } else {
            SessionState::Stopped
        };
        StandaloneView {
            marker,
            liveness,
            state,
            session,
        }
    }

    fn in_process_view(&self) -> InProcessView {
        match self.in_process.read().as_ref() {
            Some(handle) => InProcessView {
                state: handle.state(),
                target: Some(handle.target().clone()),
                paused: handle.is_paused(),
            },
            None => InProcessView {
                state: SessionState::Stopped,
                target: None,
                paused: false,
            },
        }
    }

    async fn find_orphans(&self) -> Vec<u32> {
        let processes = self.processes.clone();
        let name = self.settings.process_name.clone();
        let query = tokio::task::spawn_blocking(move || processes.find_by_name(&name));
        match tokio::time::timeout(self.settings.liveness_timeout, query).await {
            Ok(Ok(mut pids)) => {
                pids.sort_unstable();
                pids.dedup();
                pids
            }
            _ => {
                debug!("Process listing did not complete, skipping orphan check");
                Vec::new()
            }
        }
    }

    fn protection_signal(&self, file: Option<&ConfigFile>, active_target: Option<&TargetIdentity>) -> ProtectionSignal {
        let last_modified = file.and_then(|f| f.modified);
        let recently_modified = last_modified.is_some_and(|modified| {
            Utc::now()
                .signed_duration_since(modified)
                .to_std()
                .map(|age| age <= self.settings.recent_activity_window)
                .unwrap_or(true)
        });
        let carries_target = active_target.map(|target| {
            file.is_some_and(|f| self.store.keys().diverging(&f.content, target).is_empty())
        });
        ProtectionSignal {
            config_present: file.is_some(),
            last_modified,
            recently_modified,
            carries_target,
        }
    }
}

/// On-disk inputs of one status pass.
struct DiskSample {
    marker: PidMarker,
    session: Option<SessionConfig>,
    config: Option<ConfigFile>,
    recent_log: Vec<String>,
}

impl DiskSample {
    fn read(persistence: &SessionPersistence, store: &ConfigStore) -> Self {
        let marker = persistence.read_pid().unwrap_or_else(|e| {
            warn!("Cannot read PID marker: {}", e);
            PidMarker::Unreadable
        });
        let session = persistence.load_session().unwrap_or_else(|e| {
            warn!("Ignoring session config: {}", e);
            None
        });
        let config = store.read().unwrap_or_else(|e| {
            debug!("Cannot sample {:?}: {}", store.path(), e);
            None
        });
        Self {
            marker,
            session,
            config,
            recent_log: persistence.action_log().tail(RECENT_LOG_LINES),
        }
    }
}

/// Run [`StatusReconciler::sync`] every `interval` and publish each resulting
/// snapshot. The monitor ends once every receiver is dropped.
pub fn spawn_status_monitor(
    reconciler: Arc<StatusReconciler>,
    interval: Duration,
) -> (JoinHandle<()>, watch::Receiver<Option<StatusSnapshot>>) {
    let (tx, rx) = watch::channel(None);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_mode: Option<SessionMode> = None;

        loop {
            ticker.tick().await;
            let outcome = reconciler.sync().await;
            let mode = outcome.after.report.mode;
            if let Some(previous) = last_mode
                && previous != mode
            {
                info!("Enforcement mode changed: {} -> {}", previous, mode);
            }
            last_mode = Some(mode);
            debug!("Status: {}", outcome.after.summary());

            if tx.send(Some(outcome.after)).is_err() {
                debug!("No status subscribers left, stopping monitor");
                break;
            }
        }
    });
    (task, rx)
}
