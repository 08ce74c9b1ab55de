//! warden-core: presence detection building blocks.
//!
//! Signature catalog, face matching against it, the consecutive non-owner
//! presence counter, and alert composition. Face detection and signature
//! extraction sit behind [`FaceAnalyzer`]; [`OnnxAnalyzer`] runs SCRFD and
//! ArcFace through ONNX Runtime.

pub mod alert;
pub mod analyzer;
pub mod catalog;
pub mod detector;
pub mod matcher;
pub mod presence;
pub mod recognizer;
pub mod types;

pub use alert::{compose_message, select_intruder, AlertEpisode, Intruder, MessageTemplates};
pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use catalog::{CatalogError, CatalogSnapshot, SignatureCatalog, SignatureSource};
pub use matcher::FaceMatcher;
pub use presence::PresenceTracker;
pub use types::{BoundingBox, DetectionResult, FaceRegion, Signature, SignatureRecord};
