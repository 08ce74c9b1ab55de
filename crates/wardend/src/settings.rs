//! Runtime settings from the `settings` table.
//!
//! Values are stored as strings. [`Settings::resolve`] parses them once into
//! a typed snapshot; [`SettingsHandle`] swaps that snapshot atomically so the
//! detection loop always reads one consistent set.

use serde::Serialize;
use std::sync::{Arc, RwLock};
use warden_core::MessageTemplates;

pub const KEY_DETECTION_THRESHOLD: &str = "detection_threshold";
pub const KEY_UNKNOWN_THRESHOLD: &str = "unknownThreshold";
pub const KEY_FRAME_SKIP: &str = "frame_skip";
pub const KEY_FRAME_SCALE: &str = "frame_scale";
pub const KEY_TOLERANCE: &str = "tolerance";
pub const KEY_ALERT_EMAIL: &str = "alert_email";
pub const KEY_ALERT_MESSAGE: &str = "alert_message";
pub const KEY_BLACKLIST_MESSAGE: &str = "blacklist_message";
pub const KEY_CAMERA_INDEX: &str = "camera_index";
pub const KEY_LOCK_ENABLED: &str = "lockScreenEnabled";
pub const KEY_LOCK_ENABLED_LEGACY: &str = "auto_lock";
pub const KEY_SOUND_ALERT: &str = "soundAlert";

const DEFAULT_THRESHOLD: u32 = 4;

/// Seeded into an empty database.
pub const DEFAULTS: &[(&str, &str)] = &[
    (KEY_DETECTION_THRESHOLD, "4"),
    (KEY_UNKNOWN_THRESHOLD, "3"),
    (KEY_FRAME_SKIP, "2"),
    (KEY_FRAME_SCALE, "0.25"),
    (KEY_TOLERANCE, "0.6"),
    (KEY_ALERT_EMAIL, ""),
    (KEY_ALERT_MESSAGE, "Unauthorized access detected"),
    (
        KEY_BLACKLIST_MESSAGE,
        "Warning, {name}. You are not allowed to use this computer.",
    ),
    (KEY_CAMERA_INDEX, "0"),
    (KEY_LOCK_ENABLED, "true"),
    (KEY_SOUND_ALERT, "true"),
];

/// True for keys the daemon reads.
pub fn is_known_key(key: &str) -> bool {
    key == KEY_LOCK_ENABLED_LEGACY || default_for(key).is_some()
}

/// Where raw setting strings come from.
pub trait SettingsSource: Send + Sync {
    /// Stored value for `key`, or `None` when absent or unreadable.
    fn setting(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Consecutive non-owner frames before an alert.
    pub alert_threshold: u32,
    /// Process every Nth captured frame. Always >= 1.
    pub frame_skip: u32,
    /// Downscale factor in (0, 1].
    pub frame_scale: f32,
    /// Maximum signature distance for a match.
    pub tolerance: f32,
    pub alert_email: String,
    pub alert_message: String,
    pub blacklist_message: String,
    pub camera_index: u32,
    pub lock_enabled: bool,
    pub sound_alert: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self::resolve(&Defaults)
    }
}

struct Defaults;

impl SettingsSource for Defaults {
    fn setting(&self, key: &str) -> Option<String> {
        default_for(key).map(str::to_string)
    }
}

fn default_for(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

impl Settings {
    /// Parse a typed snapshot from `source`, falling back to defaults.
    pub fn resolve(source: &dyn SettingsSource) -> Self {
        let raw = |key: &str| source.setting(key).or_else(|| default_for(key).map(str::to_string));

        let frame_skip = match parse::<u32>(KEY_FRAME_SKIP, raw(KEY_FRAME_SKIP)) {
            Some(0) | None => 1,
            Some(n) => n,
        };

        let frame_scale = match parse::<f32>(KEY_FRAME_SCALE, raw(KEY_FRAME_SCALE)) {
            Some(s) if s > 0.0 && s <= 1.0 => s,
            other => {
                tracing::warn!(key = KEY_FRAME_SCALE, value = ?other, "frame scale outside (0, 1]; using 1.0");
                1.0
            }
        };

        let tolerance = match parse::<f32>(KEY_TOLERANCE, raw(KEY_TOLERANCE)) {
            Some(t) if t.is_finite() && t >= 0.0 => t,
            _ => 0.6,
        };

        let lock_enabled = source
            .setting(KEY_LOCK_ENABLED)
            .or_else(|| source.setting(KEY_LOCK_ENABLED_LEGACY))
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        Self {
            alert_threshold: resolve_threshold(&raw),
            frame_skip,
            frame_scale,
            tolerance,
            alert_email: raw(KEY_ALERT_EMAIL).unwrap_or_default().trim().to_string(),
            alert_message: raw(KEY_ALERT_MESSAGE).unwrap_or_default(),
            blacklist_message: raw(KEY_BLACKLIST_MESSAGE).unwrap_or_default(),
            camera_index: parse(KEY_CAMERA_INDEX, raw(KEY_CAMERA_INDEX)).unwrap_or(0),
            lock_enabled,
            sound_alert: raw(KEY_SOUND_ALERT).map(|v| parse_bool(&v)).unwrap_or(true),
        }
    }

    pub fn templates(&self) -> MessageTemplates {
        MessageTemplates {
            default_message: self.alert_message.clone(),
            blacklist_message: self.blacklist_message.clone(),
        }
    }
}

/// `unknownThreshold`, then `detection_threshold`, then the built-in default.
/// Zero counts as unset.
fn resolve_threshold(raw: &dyn Fn(&str) -> Option<String>) -> u32 {
    match parse::<u32>(KEY_UNKNOWN_THRESHOLD, raw(KEY_UNKNOWN_THRESHOLD)) {
        Some(n) if n > 0 => return n,
        _ => tracing::warn!(
            key = KEY_UNKNOWN_THRESHOLD,
            "threshold unset or zero; falling back to {KEY_DETECTION_THRESHOLD}"
        ),
    }
    match parse::<u32>(KEY_DETECTION_THRESHOLD, raw(KEY_DETECTION_THRESHOLD)) {
        Some(n) if n > 0 => n,
        _ => {
            tracing::warn!(
                key = KEY_DETECTION_THRESHOLD,
                default = DEFAULT_THRESHOLD,
                "threshold unset or zero; using default"
            );
            DEFAULT_THRESHOLD
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "unparsable setting");
            None
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Shared, atomically replaced settings snapshot.
pub struct SettingsHandle {
    source: Arc<dyn SettingsSource>,
    current: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    /// Create a handle and load the first snapshot.
    pub fn new(source: Arc<dyn SettingsSource>) -> Self {
        let first = Arc::new(Settings::resolve(source.as_ref()));
        Self { source, current: RwLock::new(first) }
    }

    /// Re-read every key and install the new snapshot.
    pub fn reload(&self) -> Arc<Settings> {
        let next = Arc::new(Settings::resolve(self.source.as_ref()));
        match self.current.write() {
            Ok(mut guard) => *guard = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        tracing::info!(
            threshold = next.alert_threshold,
            frame_skip = next.frame_skip,
            frame_scale = next.frame_scale,
            tolerance = next.tolerance,
            camera_index = next.camera_index,
            "settings reloaded"
        );
        next
    }

    pub fn current(&self) -> Arc<Settings> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapSource(Mutex<HashMap<String, String>>);

    impl MapSource {
        fn with(pairs: &[(&str, &str)]) -> Self {
            let map = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            Self(Mutex::new(map))
        }

        fn set(&self, key: &str, value: &str) {
            self.0.lock().unwrap().insert(key.into(), value.into());
        }
    }

    impl SettingsSource for MapSource {
        fn setting(&self, key: &str) -> Option<String> {
            self.0.lock().unwrap().get(key).cloned()
        }
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.alert_threshold, 3);
        assert_eq!(s.frame_skip, 2);
        assert_eq!(s.frame_scale, 0.25);
        assert_eq!(s.tolerance, 0.6);
        assert_eq!(s.alert_email, "");
        assert!(s.lock_enabled);
        assert!(s.sound_alert);
        assert_eq!(s.camera_index, 0);
    }

    #[test]
    fn test_threshold_falls_back_to_detection_threshold() {
        let s = Settings::resolve(&MapSource::with(&[
            (KEY_UNKNOWN_THRESHOLD, "0"),
            (KEY_DETECTION_THRESHOLD, "6"),
        ]));
        assert_eq!(s.alert_threshold, 6);

        let s = Settings::resolve(&MapSource::with(&[
            (KEY_UNKNOWN_THRESHOLD, "many"),
            (KEY_DETECTION_THRESHOLD, "5"),
        ]));
        assert_eq!(s.alert_threshold, 5);
    }

    #[test]
    fn test_threshold_both_zero_uses_builtin() {
        let s = Settings::resolve(&MapSource::with(&[
            (KEY_UNKNOWN_THRESHOLD, "0"),
            (KEY_DETECTION_THRESHOLD, "0"),
        ]));
        assert_eq!(s.alert_threshold, DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_frame_skip_and_scale_coercion() {
        let s = Settings::resolve(&MapSource::with(&[
            (KEY_FRAME_SKIP, "0"),
            (KEY_FRAME_SCALE, "1.5"),
        ]));
        assert_eq!(s.frame_skip, 1);
        assert_eq!(s.frame_scale, 1.0);

        let s = Settings::resolve(&MapSource::with(&[(KEY_FRAME_SCALE, "0")]));
        assert_eq!(s.frame_scale, 1.0);
    }

    #[test]
    fn test_lock_enabled_legacy_alias() {
        let s = Settings::resolve(&MapSource::with(&[(KEY_LOCK_ENABLED_LEGACY, "false")]));
        assert!(!s.lock_enabled);

        let s = Settings::resolve(&MapSource::with(&[
            (KEY_LOCK_ENABLED, "TRUE"),
            (KEY_LOCK_ENABLED_LEGACY, "false"),
        ]));
        assert!(s.lock_enabled);
    }

    #[test]
    fn test_handle_reload_swaps_snapshot() {
        let source = Arc::new(MapSource::with(&[(KEY_UNKNOWN_THRESHOLD, "3")]));
        let handle = SettingsHandle::new(source.clone());
        let before = handle.current();
        assert_eq!(before.alert_threshold, 3);

        source.set(KEY_UNKNOWN_THRESHOLD, "7");
        assert_eq!(handle.current().alert_threshold, 3);
        handle.reload();
        assert_eq!(handle.current().alert_threshold, 7);
        // Earlier readers keep the snapshot they took.
        assert_eq!(before.alert_threshold, 3);
    }

    #[test]
    fn test_known_keys() {
        assert!(is_known_key(KEY_TOLERANCE));
        assert!(is_known_key(KEY_LOCK_ENABLED_LEGACY));
        assert!(!is_known_key("tolerence"));
    }

    #[test]
    fn test_templates_from_settings() {
        let t = Settings::default().templates();
        assert_eq!(t.default_message, "Unauthorized access detected");
        assert!(t.blacklist_message.contains("{name}"));
    }
}
