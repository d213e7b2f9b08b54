//! Async utilities to wait for file system convergence

use crate::helpers::fixture::GuardedDir;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const POLL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum WaitError {
    Timeout,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "Wait operation timed out"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for(mut check: impl FnMut() -> bool, timeout: Duration) -> Result<(), WaitError> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return Ok(());
        }
        sleep(POLL).await;
    }
    if check() { Ok(()) } else { Err(WaitError::Timeout) }
}

/// Wait until the primary file carries `expected` under `key`.
pub async fn wait_for_field(dir: &GuardedDir, key: &str, expected: &str, timeout: Duration) -> Result<(), WaitError> {
    wait_for(|| dir.field(key).as_deref() == Some(expected), timeout).await
}
