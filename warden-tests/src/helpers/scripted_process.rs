//! Process controller driven by a script instead of the OS

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use warden_daemon::errors::Result;
use warden_daemon::process::{Liveness, ProcessController};

/// Answers liveness queries from a table and records terminations.
/// Unlisted PIDs are `Dead`.
#[derive(Default)]
pub struct ScriptedProcessController {
    liveness: Mutex<HashMap<u32, Liveness>>,
    named: Mutex<Vec<u32>>,
    delay: Mutex<Option<Duration>>,
    terminated: Mutex<Vec<u32>>,
}

impl ScriptedProcessController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(pid: u32, liveness: Liveness) -> Self {
        let controller = Self::default();
        controller.set(pid, liveness);
        controller
    }

    pub fn set(&self, pid: u32, liveness: Liveness) {
        self.liveness.lock().insert(pid, liveness);
    }

    /// PIDs reported by name lookup, i.e. orphan candidates.
    pub fn set_named(&self, pids: Vec<u32>) {
        *self.named.lock() = pids;
    }

    /// Block every liveness query for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

impl ProcessController for ScriptedProcessController {
    fn is_alive(&self, pid: u32) -> Liveness {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.liveness.lock().get(&pid).copied().unwrap_or(Liveness::Dead)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.terminated.lock().push(pid);
        self.liveness.lock().insert(pid, Liveness::Dead);
        Ok(())
    }

    fn find_by_name(&self, _name: &str) -> Vec<u32> {
        self.named.lock().clone()
    }
}
