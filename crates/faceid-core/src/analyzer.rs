//! Single-face analysis: detect the strongest face, then describe it.

use crate::detector::{DetectorError, DetectorOptions, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceDetection;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("failed to load face models: {0}")]
    ModelLoad(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns a frame into at most one described face.
pub trait FaceAnalyzer {
    /// Returns `None` when the frame contains no detectable face.
    fn analyze(&mut self, frame: &RgbImage) -> Result<Option<FaceDetection>, AnalyzerError>;
}

/// SCRFD detection followed by 128-d descriptor extraction.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    /// Load both models. Any failure is reported as [`AnalyzerError::ModelLoad`].
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        options: DetectorOptions,
    ) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(detector_path, options)
            .map_err(|e| AnalyzerError::ModelLoad(e.to_string()))?;
        let recognizer =
            FaceRecognizer::load(recognizer_path).map_err(|e| AnalyzerError::ModelLoad(e.to_string()))?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Option<FaceDetection>, AnalyzerError> {
        let faces = self.detector.detect(frame)?;
        let Some(bbox) = faces.into_iter().next() else {
            return Ok(None);
        };

        let descriptor = self.recognizer.extract(frame, &bbox)?;
        tracing::debug!(confidence = bbox.confidence, "face analyzed");
        Ok(Some(FaceDetection { bbox, descriptor }))
    }
}
