//! Alert/lockdown sequence for one threshold crossing.
//!
//! Steps run in a fixed order: capture, speak, notify, audit, grace period,
//! lock. Every step after selection is best-effort; a failing collaborator
//! is logged and the sequence continues.

use crate::evidence::EvidenceStore;
use crate::lockdown::Lockdown;
use crate::notify::{Notification, Notifier};
use crate::settings::Settings;
use crate::speech::Announcer;
use crate::store::{AuditLog, AuditRecord};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warden_core::alert::ALERT_INTRUSION;
use warden_core::{compose_message, select_intruder, AlertEpisode, DetectionResult};

const CAPTURE_PREFIX: &str = "intrusion";

/// What happened during one alert episode.
#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    pub episode_id: Uuid,
    pub alert_type: &'static str,
    pub locked: bool,
    pub capture_path: Option<String>,
    pub screenshot_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub email_sent: bool,
    pub message: String,
    pub intruder_name: String,
    pub is_blacklisted: bool,
}

pub struct AlertOrchestrator {
    evidence: EvidenceStore,
    announcer: Arc<dyn Announcer>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditLog>,
    lockdown: Arc<dyn Lockdown>,
    grace_period: Duration,
}

impl AlertOrchestrator {
    pub fn new(
        evidence: EvidenceStore,
        announcer: Arc<dyn Announcer>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditLog>,
        lockdown: Arc<dyn Lockdown>,
        grace_period: Duration,
    ) -> Self {
        Self { evidence, announcer, notifier, audit, lockdown, grace_period }
    }

    /// Run the full sequence. Blocks for the grace period.
    ///
    /// `frame` is the full-resolution frame that crossed the threshold; it is
    /// saved as the capture.
    pub fn trigger(
        &self,
        detections: &[DetectionResult],
        frame: Option<&RgbImage>,
        settings: &Settings,
    ) -> AlertOutcome {
        let intruder = select_intruder(detections);
        let message = compose_message(&intruder, &settings.templates());
        let mut episode = AlertEpisode::new(intruder, message, Utc::now());

        tracing::info!(
            episode = %episode.episode_id,
            intruder = %episode.intruder.name,
            blacklisted = episode.intruder.is_blacklisted,
            faces = detections.len(),
            "alert triggered"
        );

        // 1. Capture
        episode.image_capture_ref = frame.and_then(|f| match self.evidence.save_frame(f, CAPTURE_PREFIX) {
            Ok(name) => Some(name),
            Err(e) => {
                tracing::warn!(error = %e, "intrusion capture failed");
                None
            }
        });

        // 2. Speak
        if settings.sound_alert {
            self.announcer.announce(&episode.message);
        }

        // 3. Notify
        let email_sent = match self.notifier.send(&self.notification(&episode, settings)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "alert notification not sent");
                false
            }
        };

        // 4. Audit
        let record = AuditRecord {
            kind: ALERT_INTRUSION.to_string(),
            owner_id: episode.intruder.owner_id,
            details: serde_json::json!({
                "alert_type": episode.alert_type,
                "intruder_name": episode.intruder.name,
                "is_blacklisted": episode.intruder.is_blacklisted,
                "email_sent": email_sent,
                "timestamp": episode.triggered_at.to_rfc3339(),
                "episode_id": episode.episode_id.to_string(),
                "message": episode.message,
            }),
            image_ref: episode.image_capture_ref.clone(),
            at: episode.triggered_at,
        };
        if let Err(e) = self.audit.append_audit_record(&record) {
            tracing::warn!(error = %e, "audit write failed");
        }

        // 5. Grace period
        if !self.grace_period.is_zero() {
            std::thread::sleep(self.grace_period);
        }

        // 6. Lockdown
        let screenshot_path = self
            .lockdown
            .screenshot(self.evidence.dir())
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        let locked = if settings.lock_enabled {
            match self.lockdown.lock() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "session lock failed");
                    false
                }
            }
        } else {
            tracing::info!("session lock disabled in settings");
            false
        };

        tracing::info!(
            episode = %episode.episode_id,
            locked,
            email_sent,
            capture = episode.image_capture_ref.as_deref().unwrap_or("-"),
            "alert complete"
        );

        // 7. Report
        AlertOutcome {
            episode_id: episode.episode_id,
            alert_type: episode.alert_type,
            locked,
            capture_path: episode.image_capture_ref,
            screenshot_path,
            timestamp: episode.triggered_at,
            email_sent,
            message: episode.message,
            intruder_name: episode.intruder.name,
            is_blacklisted: episode.intruder.is_blacklisted,
        }
    }

    fn notification(&self, episode: &AlertEpisode, settings: &Settings) -> Notification {
        let who = if episode.intruder.is_blacklisted {
            format!("<b>{}</b> (blacklisted)", html_text(&episode.intruder.name))
        } else {
            format!("<b>{}</b>", html_text(&episode.intruder.name))
        };
        let lock_line = if settings.lock_enabled {
            "<p>The session is being locked.</p>"
        } else {
            ""
        };
        let body = format!(
            "<h2>Security alert</h2>\n<p>{}</p>\n<p>Detected: {who}</p>\n<p>Time: {}</p>\n{lock_line}",
            html_text(&episode.message),
            episode.triggered_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        Notification {
            to: settings.alert_email.clone(),
            subject: format!("[Warden] Security alert - {}", episode.alert_type),
            body,
            attachment: episode
                .image_capture_ref
                .as_deref()
                .map(|name| self.evidence.path_of(name)),
        }
    }
}

fn html_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
