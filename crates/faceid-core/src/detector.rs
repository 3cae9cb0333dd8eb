//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame into the square model input, decodes the three
//! anchor-free stride levels into boxes and five-point landmarks, then applies
//! non-maximum suppression.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tunables for detection.
#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    /// Side of the square model input. Must be a multiple of 32.
    pub input_size: usize,
    /// Candidates scoring at or below this are dropped.
    pub score_threshold: f32,
    /// Overlap above which the weaker of two boxes is suppressed.
    pub nms_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// How the frame was placed inside the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input_size: usize) -> (Self, u32, u32) {
        let side = input_size as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, input_size as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, input_size as u32);
        let letterbox = Self {
            scale,
            pad_x: ((input_size as u32 - new_w) / 2) as f32,
            pad_y: ((input_size as u32 - new_h) / 2) as f32,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model-input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideSlots = (usize, usize, usize);

/// Raw outputs of one stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    options: DetectorOptions,
    /// Output slots for strides [8, 16, 32], discovered at load time.
    slots: [StrideSlots; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, options: DetectorOptions) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps for 3 strides), model has {}",
                output_names.len()
            )));
        }

        let slots = output_slots(&output_names);
        tracing::info!(
            path = %model_path.display(),
            input_size = options.input_size,
            ?slots,
            "loaded SCRFD model"
        );

        Ok(Self { session, options, slots })
    }

    /// Detect faces in an RGB frame, strongest first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, self.options.input_size);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(self.slots.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };

            let level = StrideOutputs {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "landmarks")?,
            };
            candidates.extend(level.decode(self.options.input_size, &letterbox, self.options.score_threshold));
        }

        let faces = nms(candidates, self.options.nms_threshold);
        tracing::debug!(faces = faces.len(), "SCRFD detection done");
        Ok(faces)
    }
}

/// Letterbox the frame into an NCHW tensor normalized for SCRFD.
fn preprocess(frame: &RgbImage, input_size: usize) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(frame.width(), frame.height(), input_size);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    // Padding normalizes to 0.0
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output names to stride slots.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// opaque numeric names in the standard order: scores, then bboxes, then kps.
fn output_slots(names: &[String]) -> [StrideSlots; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional order");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

impl StrideOutputs<'_> {
    fn decode(&self, input_size: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cells_per_row = input_size / self.stride;
        let anchors = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        (0..anchors.min(self.scores.len()))
            .filter(|&i| self.scores[i] > threshold)
            .filter_map(|i| {
                let cell = i / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % cells_per_row) as f32 * step;
                let cy = (cell / cells_per_row) as f32 * step;

                let d = self.bboxes.get(i * 4..i * 4 + 4)?;
                let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.kps.get(i * 10..i * 10 + 10).map(|k| {
                    std::array::from_fn(|p| letterbox.to_frame(cx + k[p * 2] * step, cy + k[p * 2 + 1] * step))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: self.scores[i],
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; result is sorted by confidence, highest first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
