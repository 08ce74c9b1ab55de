//! Face detection and signature extraction behind one trait.
//!
//! The matcher only needs "where are the faces" and "what is this face's
//! signature". [`OnnxAnalyzer`] answers both with SCRFD + ArcFace; tests
//! plug in scripted fakes.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{FaceRegion, Signature};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// Default ArcFace recognition model file name.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analysis failed: {0}")]
    Failed(String),
}

pub trait FaceAnalyzer: Send {
    /// Locate faces in `image`, in `image` pixel coordinates.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalyzerError>;

    /// Compute a comparable signature for one region of `image`.
    fn signature(&mut self, image: &RgbImage, region: &FaceRegion)
        -> Result<Signature, AnalyzerError>;
}

/// SCRFD detector + ArcFace recognizer via ONNX Runtime.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir` using the default file names.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        Self::load_files(
            &model_dir.join(DETECTOR_MODEL_FILE),
            &model_dir.join(RECOGNIZER_MODEL_FILE),
        )
    }

    pub fn load_files(detector_path: &Path, recognizer_path: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
        Ok(self.detector.detect(image)?)
    }

    fn signature(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<Signature, AnalyzerError> {
        Ok(self.recognizer.extract(image, region)?)
    }
}

/// Directory searched for model files when none is configured.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("warden/models")
}
