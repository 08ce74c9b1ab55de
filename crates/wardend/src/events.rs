//! Non-blocking fan-out of annotated frames and alerts.
//!
//! Publishing never waits on subscribers. A subscriber that falls behind
//! loses the oldest events and sees `RecvError::Lagged`.

use crate::orchestrator::AlertOutcome;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use warden_core::DetectionResult;

const JPEG_QUALITY: u8 = 80;

/// One processed frame with its detections.
#[derive(Debug, Clone, Serialize)]
pub struct FrameEvent {
    #[serde(skip)]
    pub jpeg: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub detections: Vec<DetectionResult>,
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl FrameEvent {
    /// Encode `annotated` as JPEG. `None` if encoding fails.
    pub fn encode(annotated: &RgbImage, detections: Vec<DetectionResult>, frame_number: u64) -> Option<Self> {
        let mut buf = Vec::new();
        if let Err(e) = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(annotated) {
            tracing::debug!(error = %e, "frame JPEG encode failed");
            return None;
        }
        Some(Self {
            jpeg: Arc::from(buf),
            width: annotated.width(),
            height: annotated.height(),
            detections,
            frame_number,
            timestamp: Utc::now(),
        })
    }
}

/// Summary of one completed alert episode.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
    pub intruder_name: String,
    pub is_blacklisted: bool,
    pub locked: bool,
    pub capture_ref: Option<String>,
    pub screenshot_ref: Option<String>,
    pub email_sent: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&AlertOutcome> for AlertEvent {
    fn from(o: &AlertOutcome) -> Self {
        Self {
            alert_type: o.alert_type.to_string(),
            message: o.message.clone(),
            intruder_name: o.intruder_name.clone(),
            is_blacklisted: o.is_blacklisted,
            locked: o.locked,
            capture_ref: o.capture_path.clone(),
            screenshot_ref: o.screenshot_path.clone(),
            email_sent: o.email_sent,
            timestamp: o.timestamp,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    frames_tx: broadcast::Sender<FrameEvent>,
    alerts_tx: broadcast::Sender<AlertEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel(capacity.max(1));
        let (alerts_tx, _) = broadcast::channel(capacity.max(1));
        Self { frames_tx, alerts_tx }
    }

    /// True if anyone would receive a frame. Lets the loop skip encoding.
    pub fn has_frame_subscribers(&self) -> bool {
        self.frames_tx.receiver_count() > 0
    }

    pub fn publish_frame(&self, event: FrameEvent) {
        // No receivers is not an error.
        let _ = self.frames_tx.send(event);
    }

    pub fn publish_alert(&self, event: AlertEvent) {
        if self.alerts_tx.send(event).is_err() {
            tracing::debug!("alert published with no subscribers");
        }
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameEvent> {
        self.frames_tx.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts_tx.subscribe()
    }
}
