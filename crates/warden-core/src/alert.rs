//! Intruder selection, warning text, and the per-episode record.

use crate::types::{DetectionResult, UNKNOWN_NAME};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Alert type recorded for presence-triggered episodes.
pub const ALERT_INTRUSION: &str = "intrusion";

/// Placeholder replaced by the intruder's name in message templates.
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Identity an alert is raised against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intruder {
    pub owner_id: Option<i64>,
    pub name: String,
    pub is_blacklisted: bool,
    pub custom_message: Option<String>,
}

impl Intruder {
    fn placeholder() -> Self {
        Self {
            owner_id: None,
            name: UNKNOWN_NAME.to_string(),
            is_blacklisted: false,
            custom_message: None,
        }
    }
}

impl From<&DetectionResult> for Intruder {
    fn from(d: &DetectionResult) -> Self {
        Self {
            owner_id: d.owner_id,
            name: d.display_name.clone(),
            is_blacklisted: d.is_blacklisted,
            custom_message: d.custom_message.clone(),
        }
    }
}

/// Pick who the alert is about.
///
/// Priority: first blacklisted face, then first non-owner face, then the
/// first face, then an "Unknown" placeholder for an empty list.
pub fn select_intruder(detections: &[DetectionResult]) -> Intruder {
    detections
        .iter()
        .find(|d| d.is_blacklisted)
        .or_else(|| detections.iter().find(|d| !d.is_owner))
        .or_else(|| detections.first())
        .map(Intruder::from)
        .unwrap_or_else(Intruder::placeholder)
}

/// Configured wording for spoken and written warnings.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    /// Generic warning, e.g. "Unauthorized access detected".
    pub default_message: String,
    /// Template for blacklisted intruders; may contain `{name}`.
    pub blacklist_message: String,
}

/// Warning text for `intruder`.
///
/// The intruder's own template wins, then the blacklist template, then
/// `"<default>. <name> detected."`.
pub fn compose_message(intruder: &Intruder, templates: &MessageTemplates) -> String {
    if let Some(custom) = intruder.custom_message.as_deref().filter(|m| !m.trim().is_empty()) {
        return custom.replace(NAME_PLACEHOLDER, &intruder.name);
    }
    if intruder.is_blacklisted {
        return templates.blacklist_message.replace(NAME_PLACEHOLDER, &intruder.name);
    }
    let base = templates.default_message.trim_end_matches(['.', ' ']);
    format!("{base}. {} detected.", intruder.name)
}

/// One threshold crossing, from trigger to report.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEpisode {
    pub episode_id: Uuid,
    pub alert_type: &'static str,
    pub intruder: Intruder,
    pub message: String,
    pub image_capture_ref: Option<String>,
    pub triggered_at: DateTime<Utc>,
}

impl AlertEpisode {
    pub fn new(intruder: Intruder, message: String, triggered_at: DateTime<Utc>) -> Self {
        Self {
            episode_id: Uuid::new_v4(),
            alert_type: ALERT_INTRUSION,
            intruder,
            message,
            image_capture_ref: None,
            triggered_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn bbox() -> BoundingBox {
        BoundingBox { top: 0, right: 10, bottom: 10, left: 0 }
    }

    fn known(id: i64, name: &str) -> DetectionResult {
        DetectionResult {
            owner_id: Some(id),
            display_name: name.into(),
            is_owner: false,
            is_blacklisted: false,
            custom_message: None,
            confidence: 0.7,
            bounding_box: bbox(),
        }
    }

    fn templates() -> MessageTemplates {
        MessageTemplates {
            default_message: "Unauthorized access detected".into(),
            blacklist_message: "Warning, {name}. You are not allowed here.".into(),
        }
    }

    #[test]
    fn test_blacklisted_wins_over_unknown_and_owner() {
        let unknown = DetectionResult::unknown(0.2, bbox());
        let mut banned = known(5, "mallory");
        banned.is_blacklisted = true;
        let mut owner = known(1, "alice");
        owner.is_owner = true;

        let picked = select_intruder(&[unknown, banned, owner]);
        assert_eq!(picked.name, "mallory");
        assert!(picked.is_blacklisted);
        assert_eq!(picked.owner_id, Some(5));
    }

    #[test]
    fn test_first_non_owner_when_nobody_blacklisted() {
        let mut owner = known(1, "alice");
        owner.is_owner = true;
        let picked = select_intruder(&[owner, known(2, "bob"), known(3, "carol")]);
        assert_eq!(picked.name, "bob");
    }

    #[test]
    fn test_first_detection_when_all_owners() {
        let mut a = known(1, "alice");
        a.is_owner = true;
        let mut b = known(2, "ann");
        b.is_owner = true;
        assert_eq!(select_intruder(&[a, b]).name, "alice");
    }

    #[test]
    fn test_placeholder_for_empty_list() {
        let picked = select_intruder(&[]);
        assert_eq!(picked.name, UNKNOWN_NAME);
        assert_eq!(picked.owner_id, None);
    }

    #[test]
    fn test_custom_template_substitutes_name() {
        let mut d = known(3, "bob");
        d.custom_message = Some("Hands off, {name}!".into());
        d.is_blacklisted = true;
        let msg = compose_message(&Intruder::from(&d), &templates());
        assert_eq!(msg, "Hands off, bob!");
    }

    #[test]
    fn test_blacklist_template_when_no_custom() {
        let mut d = known(3, "bob");
        d.is_blacklisted = true;
        let msg = compose_message(&Intruder::from(&d), &templates());
        assert_eq!(msg, "Warning, bob. You are not allowed here.");
    }

    #[test]
    fn test_default_message() {
        let msg = compose_message(&select_intruder(&[]), &templates());
        assert_eq!(msg, "Unauthorized access detected. Unknown detected.");

        let mut t = templates();
        t.default_message = "Intruder alert. ".into();
        let msg = compose_message(&Intruder::from(&known(2, "eve")), &t);
        assert_eq!(msg, "Intruder alert. eve detected.");
    }

    #[test]
    fn test_blank_custom_message_ignored() {
        let mut d = known(3, "bob");
        d.custom_message = Some("   ".into());
        let msg = compose_message(&Intruder::from(&d), &templates());
        assert!(msg.ends_with("bob detected."));
    }

    #[test]
    fn test_episode_defaults() {
        let ep = AlertEpisode::new(select_intruder(&[]), "m".into(), Utc::now());
        assert_eq!(ep.alert_type, ALERT_INTRUSION);
        assert!(ep.image_capture_ref.is_none());
    }
}
