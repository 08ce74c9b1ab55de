//! Alert e-mail delivery through a sendmail-compatible program.

use crate::process::{self, WaitError};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;

/// Why a notification was not delivered.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification misconfigured: {0}")]
    Misconfigured(String),
    #[error("mail authentication rejected: {0}")]
    Auth(String),
    #[error("mail transport unreachable: {0}")]
    Connect(String),
    #[error("mail delivery failed: {0}")]
    Other(String),
}

/// A message ready to hand to a [`Notifier`].
#[derive(Debug, Clone)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    /// HTML body.
    pub body: String,
    pub attachment: Option<PathBuf>,
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

// sysexits.h
const EX_NOUSER: i32 = 67;
const EX_NOPERM: i32 = 77;

/// Pipes the message into e.g. `sendmail -t -i`.
pub struct SendmailNotifier {
    command: Vec<String>,
    from: String,
    timeout: Duration,
}

impl SendmailNotifier {
    /// A transport still running after `timeout` is killed and reported as unreachable.
    pub fn new(command: Vec<String>, from: String, timeout: Duration) -> Self {
        Self { command, from, timeout }
    }

    fn render(&self, n: &Notification) -> String {
        let mut body = n.body.clone();
        if let Some(path) = &n.attachment {
            body.push_str(&format!(
                "\n<p>Capture: <code>{}</code></p>\n",
                html_escape(&path.display().to_string())
            ));
        }
        format!(
            "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nMIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=utf-8\r\n\r\n{body}\r\n",
            from = self.from,
            to = n.to,
            subject = n.subject.replace(['\r', '\n'], " "),
        )
    }
}

impl Notifier for SendmailNotifier {
    fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        if n.to.trim().is_empty() {
            return Err(NotifyError::Misconfigured("no alert recipient configured".into()));
        }
        if n.to.contains(['\r', '\n']) {
            return Err(NotifyError::Misconfigured("recipient contains a line break".into()));
        }
        let Some((program, args)) = self.command.split_first() else {
            return Err(NotifyError::Misconfigured("no mail command configured".into()));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NotifyError::Connect(format!("{program}: {e}")))?;

        let message = self.render(n);
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(message.as_bytes()) {
                drop(stdin);
                process::reap(&mut child);
                return Err(NotifyError::Other(format!("writing message: {e}")));
            }
        }

        let status = match process::wait_bounded(&mut child, self.timeout) {
            Ok(status) => status,
            Err(WaitError::TimedOut(t)) => {
                return Err(NotifyError::Connect(format!("{program} gave no answer within {t:?}")));
            }
            Err(WaitError::Io(e)) => {
                return Err(NotifyError::Other(format!("waiting for {program}: {e}")));
            }
        };
        if status.success() {
            tracing::info!(to = %n.to, "alert mail handed to transport");
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let stderr = stderr.trim().to_string();
        Err(match status.code() {
            Some(EX_NOUSER) | Some(EX_NOPERM) => NotifyError::Auth(stderr),
            Some(code) => NotifyError::Other(format!("{program} exited with {code}: {stderr}")),
            None => NotifyError::Other(format!("{program} killed by signal")),
        })
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(to: &str) -> Notification {
        Notification {
            to: to.into(),
            subject: "[Warden] Security alert".into(),
            body: "<p>hi</p>".into(),
            attachment: Some(PathBuf::from("/captures/intrusion_1.jpg")),
        }
    }

    fn sh(script: &str) -> SendmailNotifier {
        SendmailNotifier::new(
            vec!["sh".into(), "-c".into(), script.into()],
            "warden@localhost".into(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_empty_recipient_is_misconfigured() {
        let err = sh("cat >/dev/null").send(&notification("  ")).unwrap_err();
        assert!(matches!(err, NotifyError::Misconfigured(_)));
    }

    #[test]
    fn test_render_has_headers_and_attachment_path() {
        let msg = sh("true").render(&notification("ops@example.com"));
        assert!(msg.starts_with("From: warden@localhost\r\nTo: ops@example.com\r\n"));
        assert!(msg.contains("Content-Type: text/html"));
        assert!(msg.contains("/captures/intrusion_1.jpg"));
    }

    #[test]
    fn test_missing_program_is_connect() {
        let n = SendmailNotifier::new(
            vec!["/nonexistent/sendmail".into()],
            "w@l".into(),
            Duration::from_secs(5),
        );
        assert!(matches!(n.send(&notification("a@b")), Err(NotifyError::Connect(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_codes_map_to_reasons() {
        assert!(sh("cat >/dev/null").send(&notification("a@b")).is_ok());
        assert!(matches!(
            sh("cat >/dev/null; exit 77").send(&notification("a@b")),
            Err(NotifyError::Auth(_))
        ));
        assert!(matches!(
            sh("cat >/dev/null; exit 1").send(&notification("a@b")),
            Err(NotifyError::Other(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_transport_is_killed_and_reported_unreachable() {
        let n = SendmailNotifier::new(
            vec!["sh".into(), "-c".into(), "cat >/dev/null; sleep 6".into()],
            "warden@localhost".into(),
            Duration::from_millis(300),
        );
        let started = std::time::Instant::now();
        let result = n.send(&notification("a@b"));
        assert!(matches!(result, Err(NotifyError::Connect(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
