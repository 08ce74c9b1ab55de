use serde::{Deserialize, Serialize};

/// Display name given to faces that match no catalog entry.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Fixed-length face signature produced by a [`FaceAnalyzer`](crate::FaceAnalyzer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two signatures. Lower = more similar.
    pub fn distance(&self, other: &Signature) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit length. Zero vectors are left untouched.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }

    /// Decode from little-endian `f32` bytes, the on-disk representation.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// One known signature and the metadata of the person it belongs to.
///
/// Immutable once loaded into the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub owner_id: i64,
    pub display_name: String,
    pub is_owner: bool,
    pub is_blacklisted: bool,
    pub custom_message: Option<String>,
    pub signature: Signature,
    /// Row id of the stored signature this record was loaded from.
    pub source_id: i64,
}

/// Face location as `(top, right, bottom, left)` in source-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// A face region reported by the analyzer, in the coordinates of the image
/// it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl FaceRegion {
    /// Map into source-frame space by `1 / scale` and clamp to the frame.
    pub fn to_source_box(&self, scale: f32, frame_width: u32, frame_height: u32) -> BoundingBox {
        let inv = if scale > 0.0 { 1.0 / scale } else { 1.0 };
        let clamp_x = |v: f32| (v * inv).round().clamp(0.0, frame_width as f32) as u32;
        let clamp_y = |v: f32| (v * inv).round().clamp(0.0, frame_height as f32) as u32;
        BoundingBox {
            top: clamp_y(self.y),
            right: clamp_x(self.x + self.width),
            bottom: clamp_y(self.y + self.height),
            left: clamp_x(self.x),
        }
    }
}

/// Classification of one detected face in one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub owner_id: Option<i64>,
    pub display_name: String,
    pub is_owner: bool,
    pub is_blacklisted: bool,
    pub custom_message: Option<String>,
    /// In [0, 1]; `1 - distance` to the best candidate.
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

impl DetectionResult {
    pub fn unknown(confidence: f32, bounding_box: BoundingBox) -> Self {
        Self {
            owner_id: None,
            display_name: UNKNOWN_NAME.to_string(),
            is_owner: false,
            is_blacklisted: false,
            custom_message: None,
            confidence,
            bounding_box,
        }
    }

    pub fn is_known(&self) -> bool {
        self.owner_id.is_some()
    }

    /// Caption shown next to the face, e.g. `"alice (87%)"`.
    pub fn label(&self) -> String {
        format!(
            "{} ({:.0}%)",
            self.display_name,
            (self.confidence * 100.0).round()
        )
    }
}
