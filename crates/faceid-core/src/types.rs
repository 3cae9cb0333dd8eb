use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of values in a face descriptor produced by the recognition model.
pub const DESCRIPTOR_LEN: usize = 128;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;

        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Numeric face descriptor. Serialized as a plain array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every value is a finite number. JSON cannot carry NaN or infinity.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean (L2) distance between two descriptors of equal length.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A single analyzed face: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// An enrolled face. Never mutated once stored.
///
/// The on-disk field names (`name`, millisecond `timestamp`) are kept stable
/// so existing collections keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub descriptor: Descriptor,
    #[serde(rename = "name")]
    pub label: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl FaceRecord {
    /// Create a record stamped with the current time.
    pub fn new(label: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            label: label.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let d = Descriptor::new(vec![0.1, -0.4, 0.25, 0.9]);
        assert_eq!(d.euclidean_distance(&d), 0.0);
    }

    #[test]
    fn test_distance_three_four_five() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.euclidean_distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_descriptor() {
        assert!(Descriptor::new(vec![0.1, -2.0]).is_finite());
        assert!(!Descriptor::new(vec![0.1, f32::NAN]).is_finite());
        assert!(!Descriptor::new(vec![f32::NEG_INFINITY, 0.0]).is_finite());
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_shifted() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        // 50 shared over a union of 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let a = bbox(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_record_json_shape() {
        let record = FaceRecord {
            descriptor: Descriptor::new(vec![0.5, -0.25]),
            label: "Ana".into(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "descriptor": [0.5, -0.25],
                "name": "Ana",
                "timestamp": 1_700_000_000_123i64,
            })
        );

        let back: FaceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
