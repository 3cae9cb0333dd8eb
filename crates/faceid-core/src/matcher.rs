//! Nearest-neighbor threshold matching over the enrolled gallery.

use crate::types::{Descriptor, FaceRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Distance below which two descriptors are considered the same face.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching a probe descriptor against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Smallest distance seen during the scan. `None` when nothing was compared.
    pub distance: Option<f32>,
    /// Label of the matched record (if any).
    pub label: Option<String>,
    /// Enrollment time of the matched record (if any).
    pub timestamp: Option<DateTime<Utc>>,
}

impl MatchResult {
    pub fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            label: None,
            timestamp: None,
        }
    }
}

/// Strategy for comparing a probe descriptor against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, gallery: &[FaceRecord], threshold: f32) -> MatchResult;
}

/// Euclidean distance matcher.
///
/// Scans the whole gallery in storage order. Only a strictly smaller distance
/// replaces the current best, so on ties the earliest record wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, gallery: &[FaceRecord], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in gallery.iter().enumerate() {
            if record.descriptor.len() != probe.len() {
                tracing::warn!(
                    index = i,
                    label = %record.label,
                    stored = record.descriptor.len(),
                    probe = probe.len(),
                    "skipping record with mismatched descriptor length"
                );
                continue;
            }

            let distance = probe.euclidean_distance(&record.descriptor);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < threshold => MatchResult {
                matched: true,
                distance: Some(distance),
                label: Some(gallery[idx].label.clone()),
                timestamp: Some(gallery[idx].timestamp),
            },
            other => MatchResult::no_match(other.map(|(_, d)| d)),
        }
    }
}
