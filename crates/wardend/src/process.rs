//! Time-limited waits on helper programs (mail, lock, screenshot, speech).

use std::io;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("timed out after {0:?}; killed")]
    TimedOut(Duration),
    #[error("wait failed: {0}")]
    Io(#[from] io::Error),
}

/// Wait for `child` to exit, killing and reaping it once `timeout` elapses.
pub fn wait_bounded(child: &mut Child, timeout: Duration) -> Result<ExitStatus, WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            reap(child);
            return Err(WaitError::TimedOut(timeout));
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Kill and reap a child that is being abandoned.
pub fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(pid = child.id(), error = %e, "kill failed");
    }
    if let Err(e) = child.wait() {
        tracing::debug!(pid = child.id(), error = %e, "reap failed");
    }
}
