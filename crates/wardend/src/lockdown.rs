//! Session lock and screen capture.

use crate::process::wait_bounded;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("session locking unsupported: {0}")]
    Unsupported(String),
    #[error("lock command failed: {0}")]
    Failed(String),
}

pub trait Lockdown: Send + Sync {
    fn lock(&self) -> Result<(), LockError>;

    /// Capture the screen into `dest_dir`. `None` if unavailable or failed.
    fn screenshot(&self, dest_dir: &Path) -> Option<PathBuf>;
}

/// Locks via an external command, `loginctl lock-session` by default.
///
/// Each command is killed if it runs longer than `timeout`.
pub struct SessionLock {
    lock_command: Vec<String>,
    screenshot_command: Option<Vec<String>>,
    timeout: Duration,
}

impl SessionLock {
    pub fn new(
        lock_command: Vec<String>,
        screenshot_command: Option<Vec<String>>,
        timeout: Duration,
    ) -> Self {
        Self { lock_command, screenshot_command, timeout }
    }
}

impl Lockdown for SessionLock {
    fn lock(&self) -> Result<(), LockError> {
        if !cfg!(target_os = "linux") {
            return Err(LockError::Unsupported(std::env::consts::OS.to_string()));
        }
        let (program, args) = self
            .lock_command
            .split_first()
            .ok_or_else(|| LockError::Unsupported("no lock command configured".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LockError::Failed(format!("{program}: {e}")))?;
        let status = wait_bounded(&mut child, self.timeout)
            .map_err(|e| LockError::Failed(format!("{program}: {e}")))?;
        if status.success() {
            tracing::info!(command = %program, "session locked");
            Ok(())
        } else {
            Err(LockError::Failed(format!("{program} exited with {status}")))
        }
    }

    fn screenshot(&self, dest_dir: &Path) -> Option<PathBuf> {
        let (program, args) = self.screenshot_command.as_ref()?.split_first()?;
        if let Err(e) = std::fs::create_dir_all(dest_dir) {
            tracing::warn!(dir = %dest_dir.display(), error = %e, "screenshot dir unavailable");
            return None;
        }
        let path = dest_dir.join(format!("screenshot_{}.png", Utc::now().format("%Y%m%d_%H%M%S_%3f")));
        let status = Command::new(program)
            .args(args)
            .arg(&path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| e.to_string())
            .and_then(|mut child| wait_bounded(&mut child, self.timeout).map_err(|e| e.to_string()));
        match status {
            Ok(s) if s.success() && path.is_file() => Some(path),
            Ok(s) => {
                tracing::warn!(command = %program, status = %s, "screenshot failed");
                None
            }
            Err(e) => {
                tracing::warn!(command = %program, error = %e, "screenshot failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_no_screenshot_command() {
        let lock = SessionLock::new(vec!["true".into()], None, TIMEOUT);
        assert!(lock.screenshot(&std::env::temp_dir()).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_command_status() {
        assert!(SessionLock::new(vec!["true".into()], None, TIMEOUT).lock().is_ok());
        assert!(matches!(
            SessionLock::new(vec!["false".into()], None, TIMEOUT).lock(),
            Err(LockError::Failed(_))
        ));
        assert!(matches!(
            SessionLock::new(Vec::new(), None, TIMEOUT).lock(),
            Err(LockError::Unsupported(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_screenshot_command_receives_path() {
        let dir = std::env::temp_dir().join(format!("warden-shot-{}", uuid::Uuid::new_v4()));
        let lock = SessionLock::new(Vec::new(), Some(vec!["touch".into()]), TIMEOUT);
        let path = lock.screenshot(&dir).unwrap();
        assert!(path.starts_with(&dir));
        assert!(path.is_file());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_hung_lock_command_fails_at_timeout() {
        let lock = SessionLock::new(
            vec!["sleep".into(), "10".into()],
            Some(vec!["sh".into(), "-c".into(), "sleep 10".into()]),
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        assert!(matches!(lock.lock(), Err(LockError::Failed(_))));
        assert!(lock.screenshot(&std::env::temp_dir()).is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
