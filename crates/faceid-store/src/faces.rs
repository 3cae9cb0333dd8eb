//! The enrolled face collection.
//!
//! The whole collection lives as one JSON array under [`FACES_KEY`] and is
//! rewritten on every change.

use faceid_core::{Descriptor, EuclideanMatcher, FaceRecord, MatchResult, Matcher};

use crate::kv::KeyValueStore;
use crate::StoreError;

/// Key holding the serialized collection.
pub const FACES_KEY: &str = "faceid_faces";

/// Storage adapter owning the persisted collection.
pub struct FaceStore<S: KeyValueStore> {
    kv: S,
}

impl<S: KeyValueStore> FaceStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    /// All records in insertion order. A missing key is an empty collection.
    pub fn faces(&self) -> Result<Vec<FaceRecord>, StoreError> {
        match self.kv.get(FACES_KEY)? {
            Some(raw) => serde_json::from_str(&raw).map_err(StoreError::Corrupt),
            None => Ok(Vec::new()),
        }
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.faces()?.len())
    }

    /// Append a new record and persist the full collection.
    ///
    /// Descriptors holding NaN or infinity are refused: they would serialize as
    /// `null` and leave a collection that no longer parses.
    pub fn save_face(&mut self, label: &str, descriptor: Descriptor) -> Result<FaceRecord, StoreError> {
        if !descriptor.is_finite() {
            tracing::warn!(label, "refusing to store non-finite descriptor");
            return Err(StoreError::InvalidDescriptor);
        }

        let mut faces = self.faces()?;
        let record = FaceRecord::new(label, descriptor);
        faces.push(record.clone());

        let raw = serde_json::to_string(&faces).map_err(StoreError::Serialize)?;
        self.kv.set(FACES_KEY, &raw)?;

        tracing::info!(label, total = faces.len(), "face saved");
        Ok(record)
    }

    /// Drop every record. Returns how many were removed.
    ///
    /// An unreadable collection is still removed and counts as zero records.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        let removed = self.count().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "clearing unreadable face collection");
            0
        });
        self.kv.remove(FACES_KEY)?;
        tracing::info!(removed, "face collection cleared");
        Ok(removed)
    }

    /// Match a probe descriptor against the stored collection.
    pub fn match_face(&self, probe: &Descriptor, threshold: f32) -> Result<MatchResult, StoreError> {
        let faces = self.faces()?;
        Ok(EuclideanMatcher.compare(probe, &faces, threshold))
    }

    pub fn into_inner(self) -> S {
        self.kv
    }
}
