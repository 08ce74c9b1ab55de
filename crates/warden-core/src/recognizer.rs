//! ArcFace signature extraction via ONNX Runtime.
//!
//! The detected region is expanded by a margin, cropped, resized to the
//! 112×112 model input and embedded. Output is L2-normalised so Euclidean
//! distances between signatures fall in [0, 2].

use crate::types::{FaceRegion, Signature};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_SIGNATURE_DIM: usize = 512;
/// Fraction of the box size added on every side before cropping.
const CROP_MARGIN: f32 = 0.15;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded ArcFace model");

        Ok(Self { session })
    }

    pub fn extract(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<Signature, RecognizerError> {
        let face = crop_face(image, region).ok_or(RecognizerError::EmptyCrop)?;
        let input = to_input_tensor(&face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != ARCFACE_SIGNATURE_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_SIGNATURE_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Signature::new(raw.to_vec()).normalized())
    }
}

/// Crop the margin-expanded region and resize it to the model input.
/// `None` when the region does not intersect the image.
fn crop_face(image: &RgbImage, region: &FaceRegion) -> Option<RgbImage> {
    let mx = region.width * CROP_MARGIN;
    let my = region.height * CROP_MARGIN;
    let x0 = (region.x - mx).max(0.0).floor() as u32;
    let y0 = (region.y - my).max(0.0).floor() as u32;
    let x1 = ((region.x + region.width + mx).ceil().max(0.0) as u32).min(image.width());
    let y1 = ((region.y + region.height + my).ceil().max(0.0) as u32).min(image.height());
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    Some(imageops::resize(
        &crop,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

fn to_input_tensor(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}
