use crate::engine::{EngineError, EngineHandle, FlowState};
use faceid_hw::CameraError;
use std::path::PathBuf;
use std::time::Duration;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceid.FaceId1";
pub const OBJECT_PATH: &str = "/org/faceid/FaceId1";

/// D-Bus interface for the faceid daemon.
///
/// Bus name: org.faceid.FaceId1
/// Object path: /org/faceid/FaceId1
pub struct FaceIdService {
    engine: EngineHandle,
    match_threshold: f32,
    verify_timeout: Duration,
}

impl FaceIdService {
    pub fn new(engine: EngineHandle, match_threshold: f32, verify_timeout: Duration) -> Self {
        Self {
            engine,
            match_threshold,
            verify_timeout,
        }
    }

    async fn enroll_from(&self, label: &str, image: Option<PathBuf>) -> zbus::fdo::Result<String> {
        let outcome = self
            .engine
            .enroll(label.to_string(), image)
            .await
            .map_err(to_fdo)?;
        Ok(serde_json::json!({
            "label": outcome.label,
            "timestamp": outcome.timestamp,
            "confidence": outcome.confidence,
            "message": outcome.message(),
        })
        .to_string())
    }

    async fn verify_from(&self, image: Option<PathBuf>) -> zbus::fdo::Result<String> {
        let outcome = self
            .engine
            .verify_within(image, self.verify_timeout)
            .await
            .map_err(to_fdo)?;

        let mut body = serde_json::to_value(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        body["message"] = outcome.message().into();
        Ok(body.to_string())
    }
}

/// Map engine failures onto standard D-Bus errors; the message is what users see.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    let msg = err.to_string();
    match err {
        EngineError::Camera(CameraError::PermissionDenied(_)) => zbus::fdo::Error::AccessDenied(msg),
        EngineError::LabelRequired => zbus::fdo::Error::InvalidArgs(msg),
        EngineError::Camera(CameraError::ImageLoad(_)) => zbus::fdo::Error::FileNotFound(msg),
        EngineError::TimedOut => zbus::fdo::Error::TimedOut(msg),
        _ => zbus::fdo::Error::Failed(msg),
    }
}

/// Status reply built from one flow-state snapshot.
fn status_report(flows: &FlowState, match_threshold: f32) -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "camera": flows.camera.as_deref().unwrap_or("not opened"),
        "models_loaded": true,
        "faces": flows.faces,
        "match_threshold": match_threshold,
        "enroll_status": flows.enroll,
        "verify_status": flows.verify,
        "message": flows.message,
    })
}

#[interface(name = "org.faceid.FaceId1")]
impl FaceIdService {
    /// Enroll the face currently in front of the camera under `label`.
    async fn enroll(&self, label: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, "enroll requested");
        self.enroll_from(label, None).await
    }

    /// Enroll the face found in an image file.
    async fn enroll_image(&self, label: &str, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, path, "enroll from image requested");
        self.enroll_from(label, Some(PathBuf::from(path))).await
    }

    /// Verify the face in front of the camera against the enrolled faces.
    async fn verify(&self) -> zbus::fdo::Result<String> {
        tracing::info!("verify requested");
        self.verify_from(None).await
    }

    /// Verify the face found in an image file.
    async fn verify_image(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "verify from image requested");
        self.verify_from(Some(PathBuf::from(path))).await
    }

    /// Enrolled faces as JSON (labels and enrollment times, no descriptors).
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        let faces = self.engine.list().await.map_err(to_fdo)?;
        let summary: Vec<_> = faces
            .iter()
            .map(|f| serde_json::json!({ "label": f.label, "timestamp": f.timestamp }))
            .collect();
        Ok(serde_json::Value::from(summary).to_string())
    }

    /// Number of enrolled faces.
    async fn count_faces(&self) -> zbus::fdo::Result<u32> {
        let faces = self.engine.list().await.map_err(to_fdo)?;
        Ok(faces.len() as u32)
    }

    /// Remove every enrolled face. Returns how many were removed.
    async fn clear_faces(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("clear requested");
        let removed = self.engine.clear().await.map_err(to_fdo)?;
        Ok(removed as u32)
    }

    /// Return daemon status information. Answers without waiting for a running flow.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_report(&self.engine.state(), self.match_threshold).to_string())
    }
}
