//! Intrusion captures on disk.

use chrono::Utc;
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encode: {0}")]
    Encode(#[from] image::ImageError),
}

pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    /// Use `dir` for captures. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `frame` as `<prefix>_<timestamp>.jpg` and return the file name.
    pub fn save_frame(&self, frame: &RgbImage, prefix: &str) -> Result<String, EvidenceError> {
        std::fs::create_dir_all(&self.dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let name = format!("{prefix}_{stamp}.jpg");
        frame.save_with_format(self.dir.join(&name), ImageFormat::Jpeg)?;
        tracing::info!(file = %name, "capture saved");
        Ok(name)
    }

    /// Delete `.jpg`/`.png` files older than `days`. Returns how many went.
    pub fn cleanup_older_than(&self, days: u64) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.dir.display(), error = %e, "no captures to clean");
                return 0;
            }
        };
        let max_age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        let now = SystemTime::now();

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_capture = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("jpg") | Some("png")
            );
            if !is_capture {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > max_age) {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(file = %path.display(), error = %e, "capture removal failed"),
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, days, "old captures removed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("warden-evidence-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_save_frame_names_and_writes() {
        let dir = scratch_dir();
        let store = EvidenceStore::new(&dir);
        let img = RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3]));

        let name = store.save_frame(&img, "intrusion").unwrap();
        assert!(name.starts_with("intrusion_"));
        assert!(name.ends_with(".jpg"));
        assert!(store.path_of(&name).is_file());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_save_frame_fails_when_dir_unusable() {
        let file = scratch_dir();
        std::fs::write(&file, b"not a directory").unwrap();
        let store = EvidenceStore::new(&file);
        let img = RgbImage::new(4, 4);
        assert!(store.save_frame(&img, "intrusion").is_err());
        std::fs::remove_file(file).unwrap();
    }

    #[test]
    fn test_cleanup_keeps_recent_files() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("intrusion_a.jpg"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();

        let store = EvidenceStore::new(&dir);
        assert_eq!(store.cleanup_older_than(30), 0);
        assert!(dir.join("intrusion_a.jpg").exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_cleanup_huge_retention_keeps_everything() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("intrusion_a.jpg"), b"x").unwrap();

        let store = EvidenceStore::new(&dir);
        assert_eq!(store.cleanup_older_than(u64::MAX), 0);
        assert!(dir.join("intrusion_a.jpg").exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_cleanup_missing_dir() {
        assert_eq!(EvidenceStore::new(scratch_dir()).cleanup_older_than(1), 0);
    }
}
