//! Locate faces in a frame and classify each against the catalog.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::{BoundingBox, DetectionResult, Signature, SignatureRecord};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::borrow::Cow;

const COLOR_ALERT: Rgb<u8> = Rgb([220, 30, 30]);
const COLOR_OWNER: Rgb<u8> = Rgb([30, 200, 60]);
const COLOR_KNOWN: Rgb<u8> = Rgb([255, 165, 0]);
const BOX_THICKNESS: u32 = 3;

/// Nearest-neighbour classification of one signature.
///
/// Ties resolve to the earliest catalog entry. An empty catalog, or a best
/// distance above `tolerance`, yields an unknown classification. Records
/// whose length differs from the query's are never compared.
pub fn classify(
    query: &Signature,
    catalog: &[SignatureRecord],
    tolerance: f32,
    bounding_box: BoundingBox,
) -> DetectionResult {
    let mut best: Option<(usize, f32)> = None;
    for (i, record) in catalog.iter().enumerate() {
        if record.signature.len() != query.len() {
            tracing::warn!(
                source_id = record.source_id,
                len = record.signature.len(),
                expected = query.len(),
                "catalog signature length does not match analyzer output; skipping"
            );
            continue;
        }
        let d = query.distance(&record.signature);
        if d.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }

    match best {
        Some((idx, distance)) if distance <= tolerance => {
            let r = &catalog[idx];
            DetectionResult {
                owner_id: Some(r.owner_id),
                display_name: r.display_name.clone(),
                is_owner: r.is_owner,
                is_blacklisted: r.is_blacklisted,
                custom_message: r.custom_message.clone(),
                confidence: confidence(distance),
                bounding_box,
            }
        }
        Some((_, distance)) => DetectionResult::unknown(confidence(distance), bounding_box),
        None => DetectionResult::unknown(0.0, bounding_box),
    }
}

fn confidence(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Runs the analyzer over downscaled frames and classifies every face.
pub struct FaceMatcher {
    analyzer: Box<dyn FaceAnalyzer>,
    scale: f32,
}

impl FaceMatcher {
    /// `scale` is the downscale factor applied before detection, in (0, 1].
    pub fn new(analyzer: Box<dyn FaceAnalyzer>, scale: f32) -> Self {
        let mut matcher = Self { analyzer, scale: 1.0 };
        matcher.set_scale(scale);
        matcher
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Out-of-range factors fall back to full resolution.
    pub fn set_scale(&mut self, scale: f32) {
        self.scale = if scale > 0.0 && scale <= 1.0 { scale } else { 1.0 };
    }

    /// Classify every face in `frame`.
    ///
    /// Returns an annotated copy of the frame and one result per face, in
    /// detector order. With no faces the copy is identical to `frame`.
    pub fn process(
        &mut self,
        frame: &RgbImage,
        catalog: &[SignatureRecord],
        tolerance: f32,
    ) -> Result<(RgbImage, Vec<DetectionResult>), AnalyzerError> {
        let small = self.downscale(frame);
        let regions = self.analyzer.detect(&small)?;

        let mut detections = Vec::with_capacity(regions.len());
        for region in &regions {
            let signature = match self.analyzer.signature(&small, region) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "signature extraction failed; skipping face");
                    continue;
                }
            };
            let bbox = region.to_source_box(self.effective_scale(frame, &small), frame.width(), frame.height());
            detections.push(classify(&signature, catalog, tolerance, bbox));
        }

        let mut annotated = frame.clone();
        for d in &detections {
            annotate(&mut annotated, d);
        }
        Ok((annotated, detections))
    }

    fn downscale<'a>(&self, frame: &'a RgbImage) -> Cow<'a, RgbImage> {
        if self.scale >= 1.0 {
            return Cow::Borrowed(frame);
        }
        let w = ((frame.width() as f32 * self.scale).round() as u32).max(1);
        let h = ((frame.height() as f32 * self.scale).round() as u32).max(1);
        Cow::Owned(imageops::resize(frame, w, h, FilterType::Triangle))
    }

    /// Ratio actually applied, accounting for rounding of the target size.
    fn effective_scale(&self, frame: &RgbImage, small: &RgbImage) -> f32 {
        if frame.width() == 0 {
            return 1.0;
        }
        small.width() as f32 / frame.width() as f32
    }
}

/// Box colour, in priority order blacklisted > owner > known > unknown.
pub fn detection_color(d: &DetectionResult) -> Rgb<u8> {
    if d.is_blacklisted {
        COLOR_ALERT
    } else if d.is_owner {
        COLOR_OWNER
    } else if d.is_known() {
        COLOR_KNOWN
    } else {
        COLOR_ALERT
    }
}

/// Draw the box and a caption band for one detection.
fn annotate(image: &mut RgbImage, d: &DetectionResult) {
    let b = d.bounding_box;
    if b.width() == 0 || b.height() == 0 {
        return;
    }
    let color = detection_color(d);

    for t in 0..BOX_THICKNESS {
        let w = b.width().saturating_sub(2 * t);
        let h = b.height().saturating_sub(2 * t);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((b.left + t) as i32, (b.top + t) as i32).of_size(w, h);
        draw_hollow_rect_mut(image, rect, color);
    }

    let band = (b.height() / 6).clamp(4, 24).min(b.height());
    let rect = Rect::at(b.left as i32, (b.bottom - band) as i32).of_size(b.width(), band);
    draw_filled_rect_mut(image, rect, color);
}
