use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
///
/// Runtime-tunable values (thresholds, tolerance, recipient, camera index)
/// live in the settings table instead; see [`crate::settings`].
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory for intrusion captures and screenshots.
    pub captures_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Capacity of each event broadcast channel.
    pub event_capacity: usize,
    /// Pending utterances before new ones are dropped.
    pub speech_queue_depth: usize,
    /// Text-to-speech program; the message is appended as the last argument.
    pub tts_command: Vec<String>,
    /// Mail submission program, fed an RFC 5322 message on stdin.
    pub mail_command: Vec<String>,
    /// Envelope sender for alert mail.
    pub mail_from: String,
    /// Session lock program.
    pub lock_command: Vec<String>,
    /// Screenshot program; the output path is appended as the last argument.
    pub screenshot_command: Option<Vec<String>>,
    /// Longest any helper program (mail, lock, screenshot, speech) may run.
    pub command_timeout: Duration,
    /// Delay between the audit write and the session lock.
    pub grace_period: Duration,
    /// Sleep after each frame.
    pub throttle: Duration,
    /// Sleep after a failed frame read.
    pub idle_sleep: Duration,
    /// How long `stop` waits for the loop to wind down.
    pub stop_timeout: Duration,
    /// Captures older than this many days are removed at startup.
    pub capture_retention_days: u64,
    /// Start the detection loop as soon as the daemon is up.
    pub autostart: bool,
}

impl Config {
    /// Load configuration from `WARDEN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("warden");

        let db_path = std::env::var("WARDEN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("warden.db"));

        let captures_dir = std::env::var("WARDEN_CAPTURES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("captures"));

        let model_dir = std::env::var("WARDEN_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| warden_core::analyzer::default_model_dir());

        Self {
            db_path,
            captures_dir,
            model_dir,
            event_capacity: env_usize("WARDEN_EVENT_CAPACITY", 16).max(1),
            speech_queue_depth: env_usize("WARDEN_SPEECH_QUEUE", 4).max(1),
            tts_command: env_command("WARDEN_TTS_COMMAND", "espeak"),
            mail_command: env_command("WARDEN_MAIL_COMMAND", "/usr/sbin/sendmail -t -i"),
            mail_from: std::env::var("WARDEN_MAIL_FROM")
                .unwrap_or_else(|_| "warden@localhost".to_string()),
            lock_command: env_command("WARDEN_LOCK_COMMAND", "loginctl lock-session"),
            screenshot_command: std::env::var("WARDEN_SCREENSHOT_COMMAND")
                .ok()
                .map(|v| split_command(&v))
                .filter(|argv| !argv.is_empty()),
            command_timeout: Duration::from_millis(env_u64("WARDEN_COMMAND_TIMEOUT_MS", 10_000).max(1)),
            grace_period: Duration::from_secs(env_u64("WARDEN_GRACE_SECS", 3)),
            throttle: Duration::from_millis(env_u64("WARDEN_THROTTLE_MS", 33)),
            idle_sleep: Duration::from_millis(env_u64("WARDEN_IDLE_MS", 100)),
            stop_timeout: Duration::from_millis(env_u64("WARDEN_STOP_TIMEOUT_MS", 2000)),
            capture_retention_days: env_u64("WARDEN_CAPTURE_RETENTION_DAYS", 30),
            autostart: std::env::var("WARDEN_AUTOSTART")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_command(key: &str, default: &str) -> Vec<String> {
    let argv = split_command(&std::env::var(key).unwrap_or_default());
    if argv.is_empty() {
        split_command(default)
    } else {
        argv
    }
}

/// Whitespace-split a command line. No quoting.
fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("  loginctl   lock-session "),
            vec!["loginctl".to_string(), "lock-session".to_string()]
        );
        assert!(split_command("   ").is_empty());
    }
}
