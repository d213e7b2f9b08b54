//! Liveness queries and termination of the standalone service process.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::errors::{GuardianError, Result};

#[cfg(unix)]
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Outcome of a liveness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Dead,
    /// The query failed or timed out
    Unknown,
}

impl Liveness {
    pub fn is_confirmed_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// Access to the OS process table.
///
/// Implementations may block; callers bound every call with a timeout.
pub trait ProcessController: Send + Sync {
    /// Whether `pid` is a live instance of the guardian service. A PID now
    /// held by some other program is `Dead`.
    fn is_alive(&self, pid: u32) -> Liveness;

    /// Ask `pid` to exit, escalating if it does not.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// PIDs of processes named `name`, excluding the calling process.
    fn find_by_name(&self, name: &str) -> Vec<u32>;
}

/// Run [`ProcessController::is_alive`] off the async runtime, answering
/// `Unknown` when it fails or outlasts `timeout`.
pub async fn query_liveness(processes: Arc<dyn ProcessController>, pid: u32, timeout: Duration) -> Liveness {
    let query = tokio::task::spawn_blocking(move || processes.is_alive(pid));
    match tokio::time::timeout(timeout, query).await {
        Ok(Ok(liveness)) => liveness,
        Ok(Err(e)) => {
            warn!("{}", GuardianError::ProcessQueryFailed { pid, reason: e.to_string() });
            Liveness::Unknown
        }
        Err(_) => {
            warn!(
                "{}",
                GuardianError::ProcessQueryFailed {
                    pid,
                    reason: format!("no answer within {:?}", timeout)
                }
            );
            Liveness::Unknown
        }
    }
}

/// Process table access for the standalone service named `process_name`.
#[derive(Debug, Clone)]
pub struct SystemProcessController {
    process_name: String,
}

impl SystemProcessController {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

/// Owner UID and name match of `pid` in a single sysinfo refresh.
#[cfg(unix)]
fn process_identity(pid: u32, expected_name: &str) -> Option<(u32, bool)> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        false,
        ProcessRefreshKind::nothing()
            .with_user(UpdateKind::OnlyIfNotSet)
            .with_exe(UpdateKind::OnlyIfNotSet),
    );
    let process = sys.process(sysinfo_pid)?;
    Some((**process.user_id()?, is_named(process, expected_name)))
}

#[cfg(unix)]
fn is_named(process: &Process, name: &str) -> bool {
    // the kernel truncates command names, the executable path is complete
    process.name() == name
        || process
            .exe()
            .and_then(|exe| exe.file_name())
            .is_some_and(|file| file == name)
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // 0 and negative values address process groups
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

impl ProcessController for SystemProcessController {
    fn is_alive(&self, pid: u32) -> Liveness {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::kill;

            let Some(nix_pid) = to_nix_pid(pid) else {
                return Liveness::Dead;
            };
            match kill(nix_pid, None) {
                Ok(()) | Err(Errno::EPERM) => {}
                Err(Errno::ESRCH) => {
                    trace!("Process {} does not exist", pid);
                    return Liveness::Dead;
                }
                Err(e) => {
                    warn!(
                        "{}",
                        GuardianError::ProcessQueryFailed {
                            pid,
                            reason: e.to_string()
                        }
                    );
                    return Liveness::Unknown;
                }
            }

            let Some((uid, named)) = process_identity(pid, &self.process_name) else {
                trace!("Cannot query owner of PID {}", pid);
                return Liveness::Unknown;
            };
            // either mismatch means the PID was reused after our service exited
            let own_uid = nix::unistd::getuid().as_raw();
            if uid != own_uid {
                trace!("Process {} owned by UID {}, not {}", pid, uid, own_uid);
                return Liveness::Dead;
            }
            if !named {
                trace!("Process {} is not {}", pid, self.process_name);
                return Liveness::Dead;
            }
            Liveness::Alive
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Liveness::Unknown
        }
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use std::time::Duration;

            let failed = |reason: String| GuardianError::ProcessQueryFailed { pid, reason };
            let nix_pid = to_nix_pid(pid).ok_or_else(|| failed("not a process id".to_string()))?;

            if kill(nix_pid, None).is_err() {
                return Ok(());
            }
            debug!("Sending SIGTERM to {}", pid);
            kill(nix_pid, Signal::SIGTERM).map_err(|e| failed(e.to_string()))?;

            for _ in 0..50 {
                std::thread::sleep(Duration::from_millis(100));
                if kill(nix_pid, None).is_err() {
                    debug!("Process {} exited", pid);
                    return Ok(());
                }
            }

            warn!("Process {} did not respond to SIGTERM, sending SIGKILL", pid);
            kill(nix_pid, Signal::SIGKILL).map_err(|e| failed(e.to_string()))?;
            std::thread::sleep(Duration::from_millis(100));
            if kill(nix_pid, None).is_err() {
                Ok(())
            } else {
                Err(failed("survived SIGKILL".to_string()))
            }
        }

        #[cfg(not(unix))]
        {
            Err(GuardianError::ProcessQueryFailed {
                pid,
                reason: "termination is not supported on this platform".to_string(),
            })
        }
    }

    fn find_by_name(&self, name: &str) -> Vec<u32> {
        #[cfg(unix)]
        {
            let mut sys = System::new();
            sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
            );
            let own = std::process::id();
            let mut pids: Vec<u32> = sys
                .processes()
                .iter()
                .filter(|(_, process)| is_named(process, name))
                .map(|(pid, _)| pid.as_u32())
                .filter(|pid| *pid != own)
                .collect();
            pids.sort_unstable();
            pids
        }

        #[cfg(not(unix))]
        {
            let _ = name;
            Vec::new()
        }
    }
}
