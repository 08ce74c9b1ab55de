//! Live video capture.
//!
//! [`CaptureSource`] is what the detection loop reads from; [`Camera`] is the
//! V4L2 implementation. Devices are addressed by index (`/dev/video{N}`).

use crate::frame;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("not a video capture device: {0}")]
    NotCaptureDevice(String),
    #[error("no usable camera (tried index {configured} and fallback 0)")]
    NoCamera { configured: u32 },
}

/// A live frame source. Owned by exactly one context at a time.
pub trait CaptureSource: Send {
    /// Next frame, or `None` on a transient read failure. Callers retry later.
    fn read_frame(&mut self) -> Option<RgbImage>;

    /// Release the device. Safe to call repeatedly.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn device_index(&self) -> u32;
}

/// Opens capture sources by device index.
pub trait CameraOpener: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn CaptureSource>, CameraError>;
}

/// Open `configured`, falling back once to device 0 if that fails.
pub fn open_with_fallback(
    opener: &dyn CameraOpener,
    configured: u32,
) -> Result<Box<dyn CaptureSource>, CameraError> {
    match opener.open(configured) {
        Ok(source) => Ok(source),
        Err(e) if configured != 0 => {
            tracing::warn!(index = configured, error = %e, "camera open failed; falling back to index 0");
            opener.open(0).map_err(|fallback| {
                tracing::warn!(error = %fallback, "fallback camera open failed");
                CameraError::NoCamera { configured }
            })
        }
        Err(e) => {
            tracing::warn!(index = configured, error = %e, "camera open failed");
            Err(CameraError::NoCamera { configured })
        }
    }
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Grey,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// V4L2 camera.
pub struct Camera {
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    index: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl Camera {
    pub fn device_path(index: u32) -> String {
        format!("/dev/video{index}")
    }

    /// Open `/dev/video{index}` and negotiate YUYV (or GREY) at 640×480.
    pub fn open(index: u32) -> Result<Self, CameraError> {
        let path = Self::device_path(index);
        if !Path::new(&path).exists() {
            return Err(CameraError::DeviceNotFound(path));
        }

        let device = Device::with_path(&path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy(path.clone())
            } else {
                CameraError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::DeviceNotFound(format!("{path}: query caps: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(path));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = %path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device: Some(device),
            stream: None,
            index,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn ensure_stream(&mut self) -> Option<&mut MmapStream<'static>> {
        if self.stream.is_none() {
            let device = self.device.as_ref()?;
            match MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS) {
                Ok(s) => self.stream = Some(s),
                Err(e) => {
                    tracing::debug!(error = %e, "failed to start capture stream");
                    return None;
                }
            }
        }
        self.stream.as_mut()
    }

    fn convert(&self, buf: &[u8]) -> Result<RgbImage, frame::FrameError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
        }
    }

    /// List V4L2 video capture devices among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16u32)
            .filter_map(|index| {
                let path = Self::device_path(index);
                if !Path::new(&path).exists() {
                    return None;
                }
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    index,
                    path,
                    name: caps.card.clone(),
                    driver: caps.driver.clone(),
                })
            })
            .collect()
    }
}

impl CaptureSource for Camera {
    fn read_frame(&mut self) -> Option<RgbImage> {
        let stream = self.ensure_stream()?;
        let dequeued = stream.next().map(|(buf, _meta)| buf.to_vec());
        let buf = match dequeued {
            Ok(buf) => buf,
            Err(e) => {
                tracing::debug!(error = %e, "frame dequeue failed");
                // Restart the stream on the next read.
                self.stream = None;
                return None;
            }
        };

        match self.convert(&buf) {
            Ok(img) => Some(img),
            Err(e) => {
                tracing::debug!(error = %e, "frame conversion failed");
                None
            }
        }
    }

    fn close(&mut self) {
        self.stream = None;
        if self.device.take().is_some() {
            tracing::info!(index = self.index, "camera released");
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn device_index(&self) -> u32 {
        self.index
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens [`Camera`]s.
pub struct V4lOpener;

impl CameraOpener for V4lOpener {
    fn open(&self, index: u32) -> Result<Box<dyn CaptureSource>, CameraError> {
        Ok(Box::new(Camera::open(index)?))
    }
}
