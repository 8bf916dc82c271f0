//! facegate-hw: Camera access for the verification session.
//!
//! Defines the camera source / video stream contract and a V4L2
//! implementation producing grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, CameraSource, DeviceInfo, PixelFormat, V4l2CameraSource, VideoStream};
