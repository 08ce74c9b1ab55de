//! Consecutive non-owner presence tracking.
//!
//! Single writer: only the detection loop calls [`PresenceTracker::update`]
//! and [`PresenceTracker::reset`].

use crate::types::DetectionResult;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    consecutive_non_owner: u32,
    last_owner_seen_at: Option<DateTime<Utc>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one processed frame's detections into the counter.
    ///
    /// - any owner present: counter to 0, owner timestamp refreshed
    /// - faces present, none of them the owner: counter + 1
    /// - no faces: unchanged
    pub fn update(&mut self, detections: &[DetectionResult]) {
        self.update_at(detections, Utc::now());
    }

    pub fn update_at(&mut self, detections: &[DetectionResult], now: DateTime<Utc>) {
        if detections.iter().any(|d| d.is_owner) {
            self.consecutive_non_owner = 0;
            self.last_owner_seen_at = Some(now);
        } else if !detections.is_empty() {
            self.consecutive_non_owner = self.consecutive_non_owner.saturating_add(1);
        }
    }

    /// True once the counter reaches `threshold` frames.
    pub fn should_trigger(&self, threshold: u32) -> bool {
        self.consecutive_non_owner >= threshold
    }

    pub fn reset(&mut self) {
        self.consecutive_non_owner = 0;
    }

    pub fn count(&self) -> u32 {
        self.consecutive_non_owner
    }

    pub fn last_owner_seen_at(&self) -> Option<DateTime<Utc>> {
        self.last_owner_seen_at
    }
}
