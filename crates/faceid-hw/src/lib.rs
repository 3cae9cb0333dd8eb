//! faceid-hw: Capture surface.
//!
//! V4L2 webcam capture with RGB conversion, plus still-image sources behind
//! the same [`FrameSource`] trait.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{FrameSource, StillImageSource};
