use chrono::{DateTime, Utc};
use faceid_core::{AnalyzerError, EuclideanMatcher, FaceAnalyzer, FaceDetection, FaceRecord, MatchResult, Matcher};
use faceid_hw::{CameraError, Frame, FrameSource, StillImageSource};
use faceid_store::{FaceStore, KeyValueStore, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("could not access the camera: {0}")]
    Camera(#[from] CameraError),
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("face store error: {0}")]
    Store(#[from] StoreError),
    #[error("a name is required before capturing")]
    LabelRequired,
    #[error("no face detected; center your face in the frame and try again")]
    NoFaceDetected,
    #[error("no faces enrolled; enroll a face before verifying")]
    NoFacesEnrolled,
    #[error("verification timed out")]
    TimedOut,
    #[error("failed to start engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Opens the live camera on demand.
pub type CameraOpener = Box<dyn FnMut() -> Result<Box<dyn FrameSource + Send>, CameraError> + Send>;

/// Progress of the enroll flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollStatus {
    Idle,
    Detecting,
    Success,
    Error,
}

/// Progress of the verify flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Idle,
    Scanning,
    Success,
    NotFound,
}

/// Last known state of both flows plus the message shown for it.
///
/// Shared with the D-Bus side so status reads never queue behind a running flow.
/// `faces` and `camera` change only when a flow finishes.
#[derive(Debug, Clone, Serialize)]
pub struct FlowState {
    pub enroll: EnrollStatus,
    pub verify: VerifyStatus,
    pub message: Option<String>,
    /// Number of enrolled faces.
    pub faces: usize,
    /// Description of the open camera, `None` until first use.
    pub camera: Option<String>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            enroll: EnrollStatus::Idle,
            verify: VerifyStatus::Idle,
            message: None,
            faces: 0,
            camera: None,
        }
    }
}

fn update_flow_state(state: &Mutex<FlowState>, f: impl FnOnce(&mut FlowState)) {
    let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut state);
}

/// Record a verify whose caller stopped waiting.
fn mark_verify_timed_out(state: &Mutex<FlowState>) {
    update_flow_state(state, |s| {
        s.verify = VerifyStatus::NotFound;
        s.message = Some(EngineError::TimedOut.to_string());
    });
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub label: String,
    pub timestamp: DateTime<Utc>,
    /// Detector confidence of the enrolled face.
    pub confidence: f32,
}

impl EnrollOutcome {
    pub fn message(&self) -> String {
        format!("Face of {} enrolled successfully!", self.label)
    }
}

/// Result of a verification that saw a face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    Verified { label: String, distance: f32 },
    NotRecognized { distance: Option<f32> },
}

impl VerifyOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Verified { label, .. } => format!("Identity verified. Welcome, {label}!"),
            Self::NotRecognized { .. } => "Face not recognized: this face is not enrolled.".to_string(),
        }
    }
}

/// Tunables for the flows.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub frames_per_capture: usize,
    pub match_threshold: f32,
}

/// Owns the camera, the models and the store. Runs on one thread.
pub struct Engine<K: KeyValueStore> {
    open_camera: CameraOpener,
    camera: Option<Box<dyn FrameSource + Send>>,
    analyzer: Box<dyn FaceAnalyzer + Send>,
    store: FaceStore<K>,
    settings: EngineSettings,
    state: Arc<Mutex<FlowState>>,
}

impl<K: KeyValueStore> Engine<K> {
    pub fn new(
        open_camera: CameraOpener,
        analyzer: Box<dyn FaceAnalyzer + Send>,
        store: FaceStore<K>,
        settings: EngineSettings,
    ) -> Self {
        let faces = store.count().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "could not read enrolled faces");
            0
        });
        Self {
            open_camera,
            camera: None,
            analyzer,
            store,
            settings,
            state: Arc::new(Mutex::new(FlowState { faces, ..FlowState::default() })),
        }
    }

    pub fn state(&self) -> Arc<Mutex<FlowState>> {
        Arc::clone(&self.state)
    }

    fn update_state(&self, f: impl FnOnce(&mut FlowState)) {
        update_flow_state(&self.state, f);
    }

    /// The live camera, opened on first use. A failed open is retried on the next request.
    fn camera(&mut self) -> Result<&mut (dyn FrameSource + Send), CameraError> {
        let camera = match self.camera.take() {
            Some(camera) => camera,
            None => {
                let camera = (self.open_camera)()?;
                let description = camera.describe();
                tracing::info!(source = %description, "camera ready");
                self.update_state(|s| s.camera = Some(description));
                camera
            }
        };
        Ok(&mut **self.camera.insert(camera))
    }

    fn capture(&mut self, image: Option<&Path>) -> Result<Vec<Frame>, EngineError> {
        let count = self.settings.frames_per_capture.max(1);
        let captured = match image {
            Some(path) => StillImageSource::new(path).capture_frames(count),
            None => {
                let result = self.camera()?.capture_frames(count);
                if result.is_err() {
                    // reopen on the next request
                    self.camera = None;
                    self.update_state(|s| s.camera = None);
                }
                result
            }
        };

        let (frames, dark_skipped) = captured?;
        tracing::debug!(captured = frames.len(), dark_skipped, "frames captured");
        Ok(frames)
    }

    /// Analyze every frame and keep each face found.
    fn analyze(&mut self, frames: &[Frame]) -> Result<Vec<FaceDetection>, EngineError> {
        let mut faces = Vec::new();
        for frame in frames {
            if let Some(face) = self.analyzer.analyze(&frame.image)? {
                faces.push(face);
            }
        }
        Ok(faces)
    }

    /// Capture, keep the most confident face, and store its descriptor under `label`.
    pub fn enroll(&mut self, label: &str, image: Option<&Path>) -> Result<EnrollOutcome, EngineError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(EngineError::LabelRequired);
        }

        self.update_state(|s| {
            s.enroll = EnrollStatus::Detecting;
            s.message = Some("Detecting face...".into());
        });

        let result = self.run_enroll(label, image);
        self.update_state(|s| match &result {
            Ok(outcome) => {
                s.enroll = EnrollStatus::Success;
                s.message = Some(outcome.message());
                s.faces += 1;
            }
            Err(err) => {
                s.enroll = EnrollStatus::Error;
                s.message = Some(err.to_string());
            }
        });
        result
    }

    fn run_enroll(&mut self, label: &str, image: Option<&Path>) -> Result<EnrollOutcome, EngineError> {
        let frames = self.capture(image)?;
        let best = self
            .analyze(&frames)?
            .into_iter()
            .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence))
            .ok_or(EngineError::NoFaceDetected)?;

        let record = self.store.save_face(label, best.descriptor)?;
        tracing::info!(label, confidence = best.bbox.confidence, "enrolled face");

        Ok(EnrollOutcome {
            label: record.label,
            timestamp: record.timestamp,
            confidence: best.bbox.confidence,
        })
    }

    /// Capture and compare against the stored collection, keeping the closest probe.
    pub fn verify(&mut self, image: Option<&Path>) -> Result<VerifyOutcome, EngineError> {
        if self.store.count()? == 0 {
            return Err(EngineError::NoFacesEnrolled);
        }

        self.update_state(|s| {
            s.verify = VerifyStatus::Scanning;
            s.message = Some("Verifying...".into());
        });

        let result = self.run_verify(image);
        self.update_state(|s| {
            s.verify = match &result {
                Ok(VerifyOutcome::Verified { .. }) => VerifyStatus::Success,
                _ => VerifyStatus::NotFound,
            };
            s.message = Some(match &result {
                Ok(outcome) => outcome.message(),
                Err(err) => err.to_string(),
            });
        });
        result
    }

    fn run_verify(&mut self, image: Option<&Path>) -> Result<VerifyOutcome, EngineError> {
        let frames = self.capture(image)?;
        let faces = self.analyze(&frames)?;
        if faces.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }

        let gallery = self.store.faces()?;
        let threshold = self.settings.match_threshold;
        let best = faces
            .iter()
            .map(|face| EuclideanMatcher.compare(&face.descriptor, &gallery, threshold))
            .min_by(|a, b| {
                let key = |r: &MatchResult| r.distance.unwrap_or(f32::INFINITY);
                key(a).total_cmp(&key(b))
            });

        let outcome = match best {
            Some(MatchResult {
                matched: true,
                label: Some(label),
                distance: Some(distance),
                ..
            }) => VerifyOutcome::Verified { label, distance },
            other => VerifyOutcome::NotRecognized {
                distance: other.and_then(|r| r.distance),
            },
        };

        tracing::info!(?outcome, "verification finished");
        Ok(outcome)
    }

    pub fn faces(&self) -> Result<Vec<FaceRecord>, EngineError> {
        Ok(self.store.faces()?)
    }

    pub fn clear(&mut self) -> Result<usize, EngineError> {
        let removed = self.store.clear()?;
        self.update_state(|s| {
            s.enroll = EnrollStatus::Idle;
            s.verify = VerifyStatus::Idle;
            s.message = None;
            s.faces = 0;
        });
        Ok(removed)
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        label: String,
        image: Option<PathBuf>,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Verify {
        image: Option<PathBuf>,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<FaceRecord>, EngineError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: Arc<Mutex<FlowState>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Enroll from the live camera, or from `image` when given.
    pub async fn enroll(&self, label: String, image: Option<PathBuf>) -> Result<EnrollOutcome, EngineError> {
        self.request(|reply| EngineRequest::Enroll { label, image, reply }).await?
    }

    /// Verify from the live camera, or from `image` when given.
    pub async fn verify(&self, image: Option<PathBuf>) -> Result<VerifyOutcome, EngineError> {
        self.request(|reply| EngineRequest::Verify { image, reply }).await?
    }

    /// Like [`verify`](Self::verify), giving up after `limit`.
    ///
    /// On expiry the verify flow reads `NotFound` with a timeout message. A
    /// queued request is dropped unstarted; one already running finishes but
    /// leaves the timeout in the flow state.
    pub async fn verify_within(&self, image: Option<PathBuf>, limit: Duration) -> Result<VerifyOutcome, EngineError> {
        match tokio::time::timeout(limit, self.verify(image)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(?limit, "verification timed out");
                mark_verify_timed_out(&self.state);
                Err(EngineError::TimedOut)
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<FaceRecord>, EngineError> {
        self.request(|reply| EngineRequest::List { reply }).await?
    }

    pub async fn clear(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Clear { reply }).await?
    }

    /// Snapshot of the flow state. Does not wait for a running request.
    pub fn state(&self) -> FlowState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Move the engine onto a dedicated OS thread and return a handle to it.
pub fn spawn_engine<K>(mut engine: Engine<K>) -> Result<EngineHandle, EngineError>
where
    K: KeyValueStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let state = engine.state();

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { label, image, reply } => {
                        let _ = reply.send(engine.enroll(&label, image.as_deref()));
                    }
                    EngineRequest::Verify { image, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("skipping abandoned verify request");
                            continue;
                        }
                        let result = engine.verify(image.as_deref());
                        if reply.is_closed() {
                            mark_verify_timed_out(&engine.state);
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::List { reply } => {
                        let _ = reply.send(engine.faces());
                    }
                    EngineRequest::Clear { reply } => {
                        let _ = reply.send(engine.clear());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::{BoundingBox, Descriptor, DEFAULT_MATCH_THRESHOLD, DESCRIPTOR_LEN};
    use faceid_store::MemoryKvStore;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;

    /// Yields bright frames; counts how often it was asked.
    struct FakeCamera {
        captures: Arc<Mutex<usize>>,
    }

    impl FrameSource for FakeCamera {
        fn capture_frames(&mut self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
            *self.captures.lock().unwrap() += 1;
            let frames = (0..count)
                .map(|i| Frame::new(RgbImage::from_pixel(4, 4, Rgb([150, 150, 150])), i as u32))
                .collect();
            Ok((frames, 0))
        }

        fn describe(&self) -> String {
            "fake camera".into()
        }
    }

    /// Replays a scripted sequence of analysis results.
    struct ScriptedAnalyzer {
        script: VecDeque<Option<(f32, Vec<f32>)>>,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, _frame: &RgbImage) -> Result<Option<FaceDetection>, AnalyzerError> {
            Ok(self.script.pop_front().flatten().map(|(confidence, values)| FaceDetection {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence,
                    landmarks: None,
                },
                descriptor: Descriptor::new(values),
            }))
        }
    }

    fn face(confidence: f32, fill: f32) -> Option<(f32, Vec<f32>)> {
        Some((confidence, vec![fill; DESCRIPTOR_LEN]))
    }

    fn engine_with(script: Vec<Option<(f32, Vec<f32>)>>, frames: usize) -> (Engine<MemoryKvStore>, Arc<Mutex<usize>>) {
        let captures = Arc::new(Mutex::new(0));
        let opener_captures = Arc::clone(&captures);
        let opener: CameraOpener = Box::new(move || {
            Ok(Box::new(FakeCamera { captures: Arc::clone(&opener_captures) }) as Box<dyn FrameSource + Send>)
        });
        let engine = Engine::new(
            opener,
            Box::new(ScriptedAnalyzer { script: script.into() }),
            FaceStore::new(MemoryKvStore::new()),
            EngineSettings {
                frames_per_capture: frames,
                match_threshold: DEFAULT_MATCH_THRESHOLD,
            },
        );
        (engine, captures)
    }

    #[test]
    fn test_enroll_then_verify_returns_label() {
        let (mut engine, _) = engine_with(vec![face(0.9, 0.1), face(0.8, 0.1)], 1);

        let enrolled = engine.enroll("  Joana ", None).unwrap();
        assert_eq!(enrolled.label, "Joana");
        assert_eq!(engine.state().lock().unwrap().enroll, EnrollStatus::Success);

        let outcome = engine.verify(None).unwrap();
        assert_eq!(outcome, VerifyOutcome::Verified { label: "Joana".into(), distance: 0.0 });
        assert_eq!(engine.state().lock().unwrap().verify, VerifyStatus::Success);
    }

    #[test]
    fn test_enroll_requires_label() {
        let (mut engine, captures) = engine_with(vec![face(0.9, 0.1)], 1);
        assert!(matches!(engine.enroll("   ", None), Err(EngineError::LabelRequired)));
        // no capture happened
        assert_eq!(*captures.lock().unwrap(), 0);
    }

    #[test]
    fn test_enroll_without_face() {
        let (mut engine, _) = engine_with(vec![None], 1);
        assert!(matches!(engine.enroll("ana", None), Err(EngineError::NoFaceDetected)));
        assert!(engine.faces().unwrap().is_empty());

        let state = engine.state().lock().unwrap().clone();
        assert_eq!(state.enroll, EnrollStatus::Error);
        assert!(state.message.unwrap().contains("no face detected"));
    }

    #[test]
    fn test_enroll_keeps_most_confident_face() {
        let (mut engine, _) = engine_with(vec![face(0.6, 1.0), None, face(0.95, 2.0)], 3);
        let outcome = engine.enroll("best", None).unwrap();
        assert!((outcome.confidence - 0.95).abs() < 1e-6);
        assert_eq!(engine.faces().unwrap()[0].descriptor.values[0], 2.0);
    }

    #[test]
    fn test_verify_with_empty_collection() {
        let (mut engine, captures) = engine_with(vec![face(0.9, 0.1)], 1);
        assert!(matches!(engine.verify(None), Err(EngineError::NoFacesEnrolled)));
        assert_eq!(*captures.lock().unwrap(), 0);
    }

    #[test]
    fn test_verify_unknown_face() {
        let (mut engine, _) = engine_with(vec![face(0.9, 0.0), face(0.9, 1.0)], 1);
        engine.enroll("known", None).unwrap();

        let outcome = engine.verify(None).unwrap();
        assert!(matches!(outcome, VerifyOutcome::NotRecognized { distance: Some(d) } if d > 0.6));
        assert_eq!(engine.state().lock().unwrap().verify, VerifyStatus::NotFound);
    }

    #[test]
    fn test_verify_without_face() {
        let (mut engine, _) = engine_with(vec![face(0.9, 0.0), None], 1);
        engine.enroll("known", None).unwrap();
        assert!(matches!(engine.verify(None), Err(EngineError::NoFaceDetected)));
    }

    #[test]
    fn test_verify_uses_closest_probe() {
        // enroll sees one face; verify sees a far probe, then a near one
        let (mut engine, _) =
            engine_with(vec![face(0.9, 0.0), None, face(0.9, 0.5), face(0.7, 0.01)], 2);
        engine.enroll("kim", None).unwrap();

        match engine.verify(None).unwrap() {
            VerifyOutcome::Verified { label, distance } => {
                assert_eq!(label, "kim");
                assert!(distance < 0.2, "distance {distance}");
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_camera_opened_once() {
        let opens = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&opens);
        let opener: CameraOpener = Box::new(move || {
            *counter.lock().unwrap() += 1;
            Ok(Box::new(FakeCamera { captures: Arc::new(Mutex::new(0)) }) as Box<dyn FrameSource + Send>)
        });
        let mut engine = Engine::new(
            opener,
            Box::new(ScriptedAnalyzer { script: vec![face(0.9, 0.0), face(0.9, 0.0)].into() }),
            FaceStore::new(MemoryKvStore::new()),
            EngineSettings { frames_per_capture: 1, match_threshold: DEFAULT_MATCH_THRESHOLD },
        );

        assert!(engine.state().lock().unwrap().camera.is_none());
        engine.enroll("a", None).unwrap();
        engine.verify(None).unwrap();
        assert_eq!(*opens.lock().unwrap(), 1);
        assert_eq!(engine.state().lock().unwrap().camera.as_deref(), Some("fake camera"));
    }

    #[test]
    fn test_permission_denied_is_retried() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&attempts);
        let opener: CameraOpener = Box::new(move || {
            *counter.lock().unwrap() += 1;
            Err(CameraError::PermissionDenied("/dev/video0".into()))
        });
        let mut engine = Engine::new(
            opener,
            Box::new(ScriptedAnalyzer { script: VecDeque::new() }),
            FaceStore::new(MemoryKvStore::new()),
            EngineSettings { frames_per_capture: 1, match_threshold: DEFAULT_MATCH_THRESHOLD },
        );

        for _ in 0..2 {
            let err = engine.enroll("ana", None).unwrap_err();
            assert!(matches!(err, EngineError::Camera(CameraError::PermissionDenied(_))));
        }
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[test]
    fn test_clear_resets_collection() {
        let (mut engine, _) = engine_with(vec![face(0.9, 0.0), face(0.9, 0.3)], 1);
        engine.enroll("a", None).unwrap();
        engine.enroll("a", None).unwrap();
        assert_eq!(engine.clear().unwrap(), 2);
        assert!(matches!(engine.verify(None), Err(EngineError::NoFacesEnrolled)));
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (engine, _) = engine_with(vec![face(0.9, 0.2), face(0.9, 0.2)], 1);
        let handle = spawn_engine(engine).unwrap();

        handle.enroll("remote".into(), None).await.unwrap();
        assert_eq!(handle.list().await.unwrap().len(), 1);
        assert_eq!(handle.state().enroll, EnrollStatus::Success);

        let outcome = handle.verify(None).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::Verified { ref label, .. } if label == "remote"));
        assert_eq!(handle.state().camera.as_deref(), Some("fake camera"));
        assert_eq!(handle.clear().await.unwrap(), 1);
        assert_eq!(handle.state().faces, 0);
    }

    /// Scripted analyzer that waits for a go-ahead before each frame.
    struct GatedAnalyzer {
        gate: std::sync::mpsc::Receiver<()>,
        inner: ScriptedAnalyzer,
    }

    impl FaceAnalyzer for GatedAnalyzer {
        fn analyze(&mut self, frame: &RgbImage) -> Result<Option<FaceDetection>, AnalyzerError> {
            let _ = self.gate.recv();
            self.inner.analyze(frame)
        }
    }

    fn gated_handle(script: Vec<Option<(f32, Vec<f32>)>>) -> (EngineHandle, std::sync::mpsc::Sender<()>) {
        let (go, gate) = std::sync::mpsc::channel();
        let opener: CameraOpener = Box::new(|| {
            Ok(Box::new(FakeCamera { captures: Arc::new(Mutex::new(0)) }) as Box<dyn FrameSource + Send>)
        });
        let engine = Engine::new(
            opener,
            Box::new(GatedAnalyzer { gate, inner: ScriptedAnalyzer { script: script.into() } }),
            FaceStore::new(MemoryKvStore::new()),
            EngineSettings { frames_per_capture: 1, match_threshold: DEFAULT_MATCH_THRESHOLD },
        );
        (spawn_engine(engine).unwrap(), go)
    }

    async fn wait_for(handle: &EngineHandle, done: impl Fn(&FlowState) -> bool) -> FlowState {
        for _ in 0..200 {
            let state = handle.state();
            if done(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("flow state never settled: {:?}", handle.state());
    }

    #[tokio::test]
    async fn test_state_snapshot_during_enroll() {
        let (handle, go) = gated_handle(vec![face(0.9, 0.2)]);
        let running = tokio::spawn({
            let handle = handle.clone();
            async move { handle.enroll("ana".into(), None).await }
        });

        let state = wait_for(&handle, |s| s.enroll == EnrollStatus::Detecting).await;
        assert_eq!(state.faces, 0);

        go.send(()).unwrap();
        running.await.unwrap().unwrap();

        let state = handle.state();
        assert_eq!(state.enroll, EnrollStatus::Success);
        assert_eq!(state.faces, 1);
    }

    #[tokio::test]
    async fn test_verify_timeout_is_recorded() {
        let (handle, go) = gated_handle(vec![face(0.9, 0.2), face(0.9, 0.2)]);
        go.send(()).unwrap();
        handle.enroll("ana".into(), None).await.unwrap();

        let err = handle
            .verify_within(None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut));

        // the abandoned verify completes, but the timeout stays recorded
        go.send(()).unwrap();
        assert_eq!(handle.list().await.unwrap().len(), 1);
        let state = handle.state();
        assert_eq!(state.verify, VerifyStatus::NotFound);
        assert_eq!(state.message.as_deref(), Some("verification timed out"));
    }
}
