//! Spoken warnings.
//!
//! Utterances go through a bounded queue drained by one dedicated thread, so
//! the alert path never waits on audio and messages never overlap.

use crate::process::wait_bounded;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("no speech command configured")]
    NoCommand,
    #[error("speech command failed: {0}")]
    Failed(String),
}

/// Blocking text-to-speech backend. Runs on the speech worker only.
pub trait Speaker: Send {
    fn speak(&mut self, text: &str) -> Result<(), SpeechError>;
}

/// Fire-and-forget announcement, as seen by the orchestrator.
pub trait Announcer: Send + Sync {
    /// Queue `text`. Returns false if it was dropped.
    fn announce(&self, text: &str) -> bool;
}

/// Runs the configured TTS program with the text as its last argument.
pub struct CommandSpeaker {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandSpeaker {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&mut self, text: &str) -> Result<(), SpeechError> {
        let (program, args) = self.command.split_first().ok_or(SpeechError::NoCommand)?;
        let mut child = Command::new(program)
            .args(args)
            .arg(text)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SpeechError::Failed(format!("{program}: {e}")))?;
        let status = wait_bounded(&mut child, self.timeout)
            .map_err(|e| SpeechError::Failed(format!("{program}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(SpeechError::Failed(format!("{program} exited with {status}")))
        }
    }
}

/// Handle to the speech worker.
pub struct SpeechQueue {
    tx: mpsc::Sender<String>,
}

impl SpeechQueue {
    /// Spawn the worker thread with room for `depth` pending utterances.
    pub fn spawn(mut speaker: Box<dyn Speaker>, depth: usize) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(depth.max(1));
        std::thread::Builder::new()
            .name("warden-speech".into())
            .spawn(move || {
                tracing::debug!("speech worker started");
                while let Some(text) = rx.blocking_recv() {
                    if let Err(e) = speaker.speak(&text) {
                        tracing::warn!(error = %e, "speech failed");
                    }
                }
                tracing::debug!("speech worker exiting");
            })?;
        Ok(Self { tx })
    }
}

impl Announcer for SpeechQueue {
    fn announce(&self, text: &str) -> bool {
        match self.tx.try_send(text.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("speech queue full; dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("speech worker gone; dropping message");
                false
            }
        }
    }
}
