//! 128-d face recognizer via ONNX Runtime.
//!
//! Aligns a detected face to a 150×150 RGB chip and runs a ResNet face
//! recognition model that emits a 128-value descriptor.

use crate::alignment;
use crate::types::{BoundingBox, Descriptor, DESCRIPTOR_LEN};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const RECOGNIZER_INPUT_SIZE: u32 = 150;
/// Per-channel RGB means subtracted before scaling.
const RECOGNIZER_MEAN_RGB: [f32; 3] = [122.782, 117.001, 104.298];
const RECOGNIZER_SCALE: f32 = 256.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; alignment needs the detector's five points")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Descriptor extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self { session })
    }

    /// Compute the descriptor of `face` within `frame`.
    pub fn extract(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Descriptor, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let chip = alignment::align_face(frame, landmarks, RECOGNIZER_INPUT_SIZE);
        let input = preprocess(&chip);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor output: {e}")))?;

        if raw.len() != DESCRIPTOR_LEN {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {DESCRIPTOR_LEN}-value descriptor, got {}",
                raw.len()
            )));
        }

        Ok(Descriptor::new(raw.to_vec()))
    }
}

/// Convert an aligned chip into a mean-subtracted NCHW tensor.
fn preprocess(chip: &RgbImage) -> Array4<f32> {
    let (w, h) = chip.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in chip.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel.0[c] as f32 - RECOGNIZER_MEAN_RGB[c]) / RECOGNIZER_SCALE;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape() {
        let chip = RgbImage::new(RECOGNIZER_INPUT_SIZE, RECOGNIZER_INPUT_SIZE);
        let tensor = preprocess(&chip);
        assert_eq!(tensor.shape(), &[1, 3, 150, 150]);
    }

    #[test]
    fn test_preprocess_subtracts_channel_means() {
        let chip = RgbImage::from_pixel(4, 4, Rgb([200, 100, 0]));
        let tensor = preprocess(&chip);
        let expected = [
            (200.0 - 122.782) / 256.0,
            (100.0 - 117.001) / 256.0,
            (0.0 - 104.298) / 256.0,
        ];
        for (c, want) in expected.iter().enumerate() {
            let got = tensor[[0, c, 2, 3]];
            assert!((got - want).abs() < 1e-6, "channel {c}: got {got}, want {want}");
        }
    }

    #[test]
    fn test_missing_model_is_reported() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/face_recognition_128.onnx"))
            .err()
            .expect("load should fail");
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
