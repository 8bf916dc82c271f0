//! Camera source contract and the V4L2 implementation.

use crate::frame::{self, DARK_FRAME_THRESHOLD};
use facegate_core::Frame;
use serde::Serialize;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 360;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera busy: {0}")]
    Busy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera stream already stopped")]
    Stopped,
}

impl CameraError {
    /// Classify an OS error raised while opening `device`.
    pub fn from_open_error(device: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(format!("{device}: {err}")),
            io::ErrorKind::NotFound => CameraError::Unavailable(format!("{device}: {err}")),
            _ if err.raw_os_error() == Some(16) => CameraError::Busy(device.to_string()),
            _ => CameraError::Unavailable(format!("{device}: {err}")),
        }
    }
}

/// A live video stream. Dropping or stopping it releases the device.
///
/// Opening negotiates the format and holds the device. For V4L2 the driver
/// only streams inside `capture_frame`: each call maps a fresh buffer set,
/// dequeues one frame and stops streaming again when it returns.
pub trait VideoStream: Send {
    /// Grab the current frame as grayscale. Blocks until the device delivers
    /// a frame.
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;

    /// Stop every track. Calling it again is a no-op.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Something that can open a video-only, user-facing camera stream.
pub trait CameraSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn VideoStream>, CameraError>;

    /// Human-readable identifier for logs and status output.
    fn describe(&self) -> String;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// V4L2 capture device, opened on demand.
pub struct V4l2CameraSource {
    device_path: String,
}

impl V4l2CameraSource {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl CameraSource for V4l2CameraSource {
    fn open(&self) -> Result<Box<dyn VideoStream>, CameraError> {
        let path = self.device_path.as_str();
        if !Path::new(path).exists() {
            return Err(CameraError::Unavailable(format!("{path}: no such device")));
        }

        let device = Device::with_path(path).map_err(|e| CameraError::from_open_error(path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::Unavailable(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::Unavailable(format!("{path} is not a capture device")));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiation(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiation(format!("failed to set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiation(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Box::new(V4l2Stream {
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            device_path: path.to_string(),
        }))
    }

    fn describe(&self) -> String {
        self.device_path.clone()
    }
}

struct V4l2Stream {
    /// `None` once stopped; dropping the handle closes the device.
    device: Option<Device>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    device_path: String,
}

impl VideoStream for V4l2Stream {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let device = self.device.as_ref().ok_or(CameraError::Stopped)?;

        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self
            .pixel_format
            .to_grayscale(buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        let is_dark = frame::is_dark_frame(&gray, DARK_FRAME_THRESHOLD);

        let mut frame = Frame::new(gray, self.width, self.height);
        frame.sequence = meta.sequence;
        frame.is_dark = is_dark;
        Ok(frame)
    }

    fn stop(&mut self) {
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, "camera stream stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.device.is_some()
    }
}
