//! warden-hw: camera capture for the presence engine.
//!
//! V4L2 capture via the `v4l` crate with conversion to RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{open_with_fallback, Camera, CameraError, CameraOpener, CaptureSource, V4lOpener};
