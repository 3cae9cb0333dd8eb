use anyhow::{Context, Result};
use faceid_core::{DetectorOptions, OnnxFaceAnalyzer};
use faceid_hw::{Camera, FrameSource};
use faceid_store::{FaceStore, SqliteKvStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{FaceIdService, BUS_NAME, OBJECT_PATH};
use engine::{CameraOpener, Engine, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceidd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    // Models are required up front; the camera is opened on first capture.
    let analyzer = OnnxFaceAnalyzer::load(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
        DetectorOptions {
            score_threshold: config.detector_score_threshold,
            ..DetectorOptions::default()
        },
    )
    .context("failed to load face detection models")?;

    let store = FaceStore::new(SqliteKvStore::open(&config.db_path).context("failed to open face store")?);
    tracing::info!(faces = store.count()?, "face store ready");

    let engine = Engine::new(
        camera_opener(&config),
        Box::new(analyzer),
        store,
        EngineSettings {
            frames_per_capture: config.frames_per_capture,
            match_threshold: config.match_threshold,
        },
    );
    let handle = engine::spawn_engine(engine)?;

    let service = FaceIdService::new(handle, config.match_threshold, config.verify_timeout());
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "faceidd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    Ok(())
}

fn camera_opener(config: &Config) -> CameraOpener {
    let device = config.camera_device.clone();
    let (width, height) = (config.camera_width, config.camera_height);
    let warmup = config.warmup_frames;

    Box::new(move || {
        let camera = Camera::open(&device, width, height)?;
        camera.warm_up(warmup)?;
        Ok(Box::new(camera) as Box<dyn FrameSource + Send>)
    })
}
