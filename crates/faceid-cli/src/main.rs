use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceid_hw::{Camera, FrameSource};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "faceid", about = "Face enrollment and verification")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face under a name
    Enroll {
        /// Name to store with the face
        #[arg(short, long)]
        label: String,
        /// Use a still image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Check a face against the enrolled ones
    Verify {
        /// Use a still image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// List enrolled faces
    List,
    /// Remove every enrolled face
    Clear,
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Camera device to probe
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
    },
}

#[zbus::proxy(
    interface = "org.faceid.FaceId1",
    default_service = "org.faceid.FaceId1",
    default_path = "/org/faceid/FaceId1"
)]
trait FaceId {
    async fn enroll(&self, label: &str) -> zbus::fdo::Result<String>;
    async fn enroll_image(&self, label: &str, path: &str) -> zbus::fdo::Result<String>;
    async fn verify(&self) -> zbus::fdo::Result<String>;
    async fn verify_image(&self, path: &str) -> zbus::fdo::Result<String>;
    async fn list_faces(&self) -> zbus::fdo::Result<String>;
    async fn count_faces(&self) -> zbus::fdo::Result<u32>;
    async fn clear_faces(&self) -> zbus::fdo::Result<u32>;
    async fn status(&self) -> zbus::fdo::Result<String>;
}

#[derive(Deserialize)]
struct Reply {
    message: String,
    #[serde(default)]
    outcome: Option<String>,
}

#[derive(Deserialize)]
struct FaceSummary {
    label: String,
    timestamp: String,
}

/// The human-readable part of a daemon error.
fn describe(err: zbus::fdo::Error) -> String {
    match err {
        zbus::fdo::Error::Failed(msg)
        | zbus::fdo::Error::AccessDenied(msg)
        | zbus::fdo::Error::InvalidArgs(msg)
        | zbus::fdo::Error::FileNotFound(msg)
        | zbus::fdo::Error::TimedOut(msg) => msg,
        zbus::fdo::Error::ServiceUnknown(_) => "faceidd is not running".to_string(),
        other => other.to_string(),
    }
}

fn absolute(path: PathBuf) -> Result<String> {
    let path = std::fs::canonicalize(&path).with_context(|| format!("cannot read {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Print the daemon's reply, or its error. Returns whether the flow succeeded.
fn report(reply: zbus::fdo::Result<String>) -> Result<bool> {
    match reply {
        Ok(json) => {
            let reply: Reply = serde_json::from_str(&json).context("malformed daemon reply")?;
            println!("{}", reply.message);
            Ok(reply.outcome.as_deref() != Some("not_recognized"))
        }
        Err(err) => {
            eprintln!("{}", describe(err));
            Ok(false)
        }
    }
}

async fn proxy() -> Result<FaceIdProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = FaceIdProxy::new(&conn).await?;
    tracing::debug!(service = %proxy.inner().destination(), "connected to session bus");
    Ok(proxy)
}

fn camera_test(device: &str) -> Result<bool> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No video capture devices found");
    }
    for d in &devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut camera = match Camera::open(device, 640, 480) {
        Ok(camera) => camera,
        Err(err) => {
            eprintln!("{device}: {err}");
            return Ok(false);
        }
    };
    println!("Opened {}", camera.describe());

    let (frames, dark) = camera.capture_frames(5)?;
    for frame in &frames {
        println!(
            "frame {:>4}  {}x{}  brightness {:.1}",
            frame.sequence,
            frame.width(),
            frame.height(),
            frame.avg_brightness()
        );
    }
    println!("{} usable frames, {} dark frames skipped", frames.len(), dark);
    Ok(!frames.is_empty())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let ok = match cli.command {
        Commands::Enroll { label, image } => {
            let proxy = proxy().await?;
            match image {
                Some(path) => {
                    let path = absolute(path)?;
                    println!("Enrolling {label} from {path}...");
                    report(proxy.enroll_image(&label, &path).await)?
                }
                None => {
                    println!("Enrolling {label}: look at the camera...");
                    report(proxy.enroll(&label).await)?
                }
            }
        }
        Commands::Verify { image } => {
            let proxy = proxy().await?;
            match proxy.count_faces().await {
                Ok(0) => {
                    eprintln!("No faces enrolled. Run `faceid enroll --label <name>` first.");
                    false
                }
                Ok(count) => {
                    println!("{count} face(s) enrolled. Verifying...");
                    match image {
                        Some(path) => report(proxy.verify_image(&absolute(path)?).await)?,
                        None => report(proxy.verify().await)?,
                    }
                }
                Err(err) => {
                    eprintln!("{}", describe(err));
                    false
                }
            }
        }
        Commands::List => {
            let proxy = proxy().await?;
            match proxy.list_faces().await {
                Ok(json) => {
                    let faces: Vec<FaceSummary> = serde_json::from_str(&json).context("malformed daemon reply")?;
                    if faces.is_empty() {
                        println!("No faces enrolled");
                    }
                    for face in faces {
                        println!("{}  {}", face.timestamp, face.label);
                    }
                    true
                }
                Err(err) => {
                    eprintln!("{}", describe(err));
                    false
                }
            }
        }
        Commands::Clear => {
            let proxy = proxy().await?;
            match proxy.clear_faces().await {
                Ok(removed) => {
                    println!("Removed {removed} enrolled face(s)");
                    true
                }
                Err(err) => {
                    eprintln!("{}", describe(err));
                    false
                }
            }
        }
        Commands::Status => match proxy().await?.status().await {
            Ok(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).context("malformed daemon reply")?;
                println!("{}", serde_json::to_string_pretty(&value)?);
                true
            }
            Err(err) => {
                eprintln!("{}", describe(err));
                false
            }
        },
        Commands::Test { device } => camera_test(&device)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
