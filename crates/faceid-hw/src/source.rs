//! Frame sources: anything that can hand the engine a batch of frames.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::path::{Path, PathBuf};

/// A source of RGB frames.
pub trait FrameSource {
    /// Capture up to `count` usable frames.
    ///
    /// Returns the frames plus the number of dark frames that were skipped.
    fn capture_frames(&mut self, count: usize) -> Result<(Vec<Frame>, usize), CameraError>;

    /// Short human-readable description for logs and status output.
    fn describe(&self) -> String;
}

/// A still image on disk, decoded on every capture.
pub struct StillImageSource {
    path: PathBuf,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the image as a single frame.
    pub fn load(&self) -> Result<Frame, CameraError> {
        let image = image::open(&self.path)
            .map_err(|e| CameraError::ImageLoad(format!("{}: {e}", self.path.display())))?
            .to_rgb8();
        tracing::debug!(
            path = %self.path.display(),
            width = image.width(),
            height = image.height(),
            "loaded still image"
        );
        Ok(Frame::new(image, 0))
    }
}

impl FrameSource for StillImageSource {
    /// A still never changes, so one frame is returned whatever `count` is.
    /// Dim photos are kept: the dark-frame filter only applies to live capture.
    fn capture_frames(&mut self, _count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        let frame = self.load()?;
        if frame.is_dark {
            tracing::debug!(path = %self.path.display(), "still image is dim; analyzing anyway");
        }
        Ok((vec![frame], 0))
    }

    fn describe(&self) -> String {
        format!("image {}", self.path.display())
    }
}
