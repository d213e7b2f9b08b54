//! Guardian session lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! A session owns one [`IdentityEnforcer`] and one run loop. The loop is the
//! single consumer of watcher events; it merges them per debounce window and
//! runs each enforcement pass to completion before taking the next one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::WardenPaths;
use crate::enforcer::{EnforcementAction, IdentityEnforcer};
use crate::errors::{GuardianError, Result};
use crate::events::collect_window;
use crate::identity::TargetIdentity;
use crate::persistence::{ActionLog, PidMarker, SessionConfig, SessionPersistence};
use crate::process::{SystemProcessController, query_liveness};
use crate::settings::Settings;
use crate::stats::{SessionStats, StatsSnapshot};
use crate::watcher::{WatchEvent, Watcher};

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// How a session is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Detached service tracked through a PID marker and session config
    Standalone,
    /// Bound to the lifetime of the controlling process
    InProcess,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Standalone => "standalone",
            RunMode::InProcess => "in-process",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of session is effectively enforcing, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    Standalone,
    InProcess,
    None,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Standalone => "standalone",
            SessionMode::InProcess => "in-process",
            SessionMode::None => "none",
        }
    }
}

impl From<RunMode> for SessionMode {
    fn from(mode: RunMode) -> Self {
        match mode {
            RunMode::Standalone => SessionMode::Standalone,
            RunMode::InProcess => SessionMode::InProcess,
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SessionShared {
    mode: RunMode,
    state: RwLock<SessionState>,
    enforcer: Arc<IdentityEnforcer>,
    paused: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Session state {} -> {}", *current, state);
            *current = state;
        }
    }
}

/// Cloneable view of a running session, handed to whoever needs to observe
/// or stop it without owning it.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("mode", &self.shared.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn mode(&self) -> RunMode {
        self.shared.mode
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn target(&self) -> &TargetIdentity {
        self.shared.enforcer.target()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Suspend or resume enforcement. Changes observed while paused are
    /// dropped; the next self-check after resuming reasserts the target.
    pub fn set_paused(&self, paused: bool) {
        if self.shared.paused.swap(paused, Ordering::SeqCst) != paused {
            info!("Enforcement {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let enforcer = &self.shared.enforcer;
        enforcer.stats().snapshot(enforcer.is_protected())
    }

    /// Ask the run loop to wind down. Returns immediately.
    pub fn request_stop(&self) {
        {
            let mut state = self.shared.state.write();
            if matches!(*state, SessionState::Starting | SessionState::Running) {
                *state = SessionState::Stopping;
            }
        }
        self.shared.shutdown.send_replace(true);
    }
}

/// One enforcement session, owned by whichever component started it.
#[derive(Debug)]
pub struct GuardianSession {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
}

impl GuardianSession {
    /// Run the initial reconcile and sweep, attach the watcher, and enter
    /// `Running`. Standalone sessions also write their marker files, which
    /// are removed again on every exit path.
    pub async fn start(
        target: TargetIdentity,
        mode: RunMode,
        settings: &Settings,
        paths: &WardenPaths,
    ) -> Result<Self> {
        let stats = Arc::new(SessionStats::new());
        let enforcer = Arc::new(IdentityEnforcer::new(settings, target, stats)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            mode,
            state: RwLock::new(SessionState::Starting),
            enforcer: enforcer.clone(),
            paused: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });
        info!("Starting {} session guarding {:?}", mode, enforcer.store().path());

        let markers = match mode {
            RunMode::Standalone => match StandaloneMarkers::acquire(paths, settings, enforcer.target()).await {
                Ok(markers) => Some(markers),
                Err(e) => {
                    shared.set_state(SessionState::Stopped);
                    return Err(e);
                }
            },
            RunMode::InProcess => None,
        };

        let initial = {
            let enforcer = enforcer.clone();
            tokio::task::spawn_blocking(move || initial_pass(&enforcer)).await
        };
        match initial {
            Ok(actions) => record(markers.as_ref(), &actions),
            Err(e) => error!("Initial enforcement pass failed: {}", e),
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let watcher = match Watcher::start(enforcer.matcher().directory(), settings.poll_interval, events_tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                shared.set_state(SessionState::Stopped);
                return Err(e);
            }
        };

        shared.set_state(SessionState::Running);
        if let Some(markers) = &markers {
            markers.log.record(&format!("guarding {}", enforcer.store().path().display()));
        }

        let run_loop = RunLoop {
            shared: shared.clone(),
            watcher,
            events: events_rx,
            shutdown: shutdown_rx,
            markers,
            debounce: settings.debounce,
            self_check_interval: settings.self_check_interval,
        };
        let task = tokio::spawn(run_loop.run());
        info!("{} session running", mode);

        Ok(Self {
            handle: SessionHandle { shared },
            task: Some(task),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn mode(&self) -> RunMode {
        self.handle.mode()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn target(&self) -> &TargetIdentity {
        self.handle.target()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.handle.get_stats()
    }

    pub fn set_paused(&self, paused: bool) {
        self.handle.set_paused(paused);
    }

    /// Stop the session and wait until the watcher is detached and markers
    /// are removed. Safe to call in any state, and more than once.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            self.handle.shared.set_state(SessionState::Stopped);
            return;
        };
        self.handle.request_stop();
        if let Err(e) = task.await
            && e.is_panic()
        {
            error!("Session run loop panicked: {}", e);
        }
        self.handle.shared.set_state(SessionState::Stopped);
        info!("{} session stopped", self.mode());
    }

    /// Wait until the run loop exits on its own, e.g. after a stop request
    /// through a [`SessionHandle`].
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }
}

impl Drop for GuardianSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.handle.request_stop();
            // dropping the loop future releases the watcher and the markers
            task.abort();
            self.handle.shared.set_state(SessionState::Stopped);
        }
    }
}

fn initial_pass(enforcer: &IdentityEnforcer) -> Vec<EnforcementAction> {
    let mut actions = Vec::new();
    match enforcer.reconcile_config() {
        Ok(action) => actions.extend(action),
        Err(e) => warn!("Initial reconcile failed: {}", e),
    }
    match enforcer.purge_ephemerals() {
        Ok(removed) => actions.extend(removed),
        Err(e) => warn!("Initial sweep failed: {}", e),
    }
    actions
}

fn record(markers: Option<&StandaloneMarkers>, actions: &[EnforcementAction]) {
    if let Some(markers) = markers {
        for action in actions {
            markers.log.record(&action.to_string());
        }
    }
}

struct RunLoop {
    shared: Arc<SessionShared>,
    watcher: Watcher,
    events: mpsc::Receiver<WatchEvent>,
    shutdown: watch::Receiver<bool>,
    markers: Option<StandaloneMarkers>,
    debounce: Duration,
    self_check_interval: Duration,
}

impl RunLoop {
    async fn run(mut self) {
        let mut self_check = tokio::time::interval(self.self_check_interval);
        self_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick is immediate and start() has just reconciled
        self_check.tick().await;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => {
                    let Some(first) = event else {
                        warn!("Watcher event channel closed");
                        break;
                    };
                    let batch = collect_window(
                        self.shared.enforcer.matcher(),
                        first,
                        &mut self.events,
                        self.debounce,
                    )
                    .await;
                    if batch.is_empty() {
                        continue;
                    }
                    if self.shared.paused.load(Ordering::SeqCst) {
                        debug!("Paused, dropping {} change(s)", batch.changes.len());
                        continue;
                    }
                    let enforcer = self.shared.enforcer.clone();
                    self.run_pass(move || enforcer.dispatch(&batch)).await;
                }
                _ = self_check.tick() => {
                    if self.shared.paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    let enforcer = self.shared.enforcer.clone();
                    self.run_pass(move || match enforcer.reconcile_config() {
                        Ok(action) => action.into_iter().collect(),
                        Err(e) => {
                            warn!("Self-check failed: {}", e);
                            Vec::new()
                        }
                    })
                    .await;
                }
            }
        }

        self.shared.set_state(SessionState::Stopping);
        self.watcher.stop();
        drop(self.markers.take());
        self.shared.set_state(SessionState::Stopped);
    }

    async fn run_pass<F>(&self, pass: F)
    where
        F: FnOnce() -> Vec<EnforcementAction> + Send + 'static,
    {
        match tokio::task::spawn_blocking(pass).await {
            Ok(actions) => record(self.markers.as_ref(), &actions),
            Err(e) => error!("Enforcement pass failed: {}", e),
        }
    }
}

/// PID marker and session config of a standalone session. Dropping it
/// removes the PID marker; the session config stays behind for resume.
struct StandaloneMarkers {
    persistence: SessionPersistence,
    log: ActionLog,
    pid: u32,
}

impl StandaloneMarkers {
    async fn acquire(paths: &WardenPaths, settings: &Settings, target: &TargetIdentity) -> Result<Self> {
        let persistence = SessionPersistence::new(paths.clone());
        let pid = std::process::id();

        if let PidMarker::Pid(existing) = persistence.read_pid()?
            && existing != pid
            && query_liveness(
                Arc::new(SystemProcessController::new(&settings.process_name)),
                existing,
                settings.liveness_timeout,
            )
            .await
            .is_confirmed_alive()
        {
            return Err(GuardianError::SessionActive(RunMode::Standalone));
        }

        persistence.save_session(&SessionConfig::new(target.clone(), Some(settings.target_file.clone())))?;
        persistence.write_pid(pid)?;
        let log = persistence.action_log();
        log.record(&format!("standalone session started (pid {})", pid));

        Ok(Self { persistence, log, pid })
    }
}

impl Drop for StandaloneMarkers {
    fn drop(&mut self) {
        if let Err(e) = self.persistence.remove_pid_if(PidMarker::Pid(self.pid)) {
            warn!("Cannot remove PID marker: {}", e);
        }
        self.log.record("standalone session stopped");
    }
}
