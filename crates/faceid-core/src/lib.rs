//! faceid-core: Face analysis and matching.
//!
//! SCRFD detection and a 128-d recognition model run through ONNX Runtime;
//! descriptors are compared against the enrolled gallery by Euclidean distance.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use detector::DetectorOptions;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use types::{BoundingBox, Descriptor, FaceDetection, FaceRecord, DESCRIPTOR_LEN};
