//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. The input frame
//! is resized to fit the 640×640 model input and anchored at the top-left
//! corner, so mapping back is a single divide by the resize scale.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Where the score and box tensors for one stride live in the output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
}

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score+bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// Detect faces, highest score first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, scale) = to_input_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let StrideOutputs { score, bbox } = self.outputs[slot];
            let (_, scores) = outputs[score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores/{stride}: {e}")))?;
            let (_, boxes) = outputs[bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes/{stride}: {e}")))?;
            candidates.extend(decode(scores, boxes, stride, scale));
        }

        Ok(suppress(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resolve output tensor positions, preferring `score_8`/`bbox_8` style names.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: u32| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some(StrideOutputs { score: position("score", s)?, bbox: position("bbox", s)? }))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        // Stock insightface export: [score x3, bbox x3, kps x3].
        None => [
            StrideOutputs { score: 0, bbox: 3 },
            StrideOutputs { score: 1, bbox: 4 },
            StrideOutputs { score: 2, bbox: 5 },
        ],
    }
}

/// Resize into the model canvas and normalise. Returns the tensor and the
/// resize scale (model pixels per source pixel).
fn to_input_tensor(image: &RgbImage) -> (Array4<f32>, f32) {
    let side = SCRFD_INPUT_SIZE as f32;
    let scale = (side / image.width() as f32).min(side / image.height() as f32);
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalises to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, scale)
}

fn decode(scores: &[f32], boxes: &[f32], stride: u32, scale: f32) -> Vec<FaceRegion> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|i| {
            let score = *scores.get(i)?;
            if score < SCRFD_SCORE_THRESHOLD {
                return None;
            }
            let d = boxes.get(i * 4..i * 4 + 4)?;
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let x1 = (cx - d[0] * step) / scale;
            let y1 = (cy - d[1] * step) / scale;
            let x2 = (cx + d[2] * step) / scale;
            let y2 = (cy + d[3] * step) / scale;
            Some(FaceRegion { x: x1, y: y1, width: x2 - x1, height: y2 - y1, score })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by descending score.
fn suppress(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<FaceRegion> = Vec::with_capacity(regions.len());
    for r in regions {
        if kept.iter().all(|k| iou(k, &r) <= iou_threshold) {
            kept.push(r);
        }
    }
    kept
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32, score: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, score }
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = region(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = region(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &region(30.0, 30.0, 5.0, 5.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_keeps_best_of_overlapping() {
        let kept = suppress(
            vec![
                region(5.0, 5.0, 100.0, 100.0, 0.8),
                region(0.0, 0.0, 100.0, 100.0, 0.9),
                region(300.0, 300.0, 40.0, 40.0, 0.7),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn test_decode_maps_back_through_scale() {
        // One confident anchor in cell (1, 2) of stride 8: center (16, 8).
        let grid = (SCRFD_INPUT_SIZE / 8) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let idx = (1 * grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let found = decode(&scores, &boxes, 8, 2.0);
        assert_eq!(found.len(), 1);
        let r = &found[0];
        assert!((r.x - 4.0).abs() < 1e-6);
        assert!((r.y - 0.0).abs() < 1e-6);
        assert!((r.width - 8.0).abs() < 1e-6);
        assert!((r.height - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_map_outputs_by_name() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mapped = map_outputs(&names);
        assert_eq!(mapped[0], StrideOutputs { score: 1, bbox: 0 });
        assert_eq!(mapped[2], StrideOutputs { score: 5, bbox: 4 });
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let mapped = map_outputs(&names);
        assert_eq!(mapped[1], StrideOutputs { score: 1, bbox: 4 });
    }

    #[test]
    fn test_input_tensor_scale_and_padding() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, scale) = to_input_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((scale - 2.0).abs() < 1e-6);
        let bright = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 10, 10]] - bright).abs() < 1e-4);
        // Below the resized content is padding.
        assert_eq!(tensor[[0, 0, 500, 10]], 0.0);
    }
}
