use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `FACEID_*`
/// environment variables (highest precedence).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture size; the driver may pick a nearby one.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database holding the face collection.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face matches.
    pub match_threshold: f32,
    /// Minimum detector score for a face candidate.
    pub detector_score_threshold: f32,
    /// Frames discarded right after the camera opens (auto-exposure settling).
    pub warmup_frames: usize,
    /// Frames analyzed per enroll or verify request.
    pub frames_per_capture: usize,
    /// Upper bound on a verify request, in seconds.
    pub verify_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = xdg_dir("XDG_DATA_HOME", ".local/share").join("faceid");
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("faces.db"),
            match_threshold: faceid_core::DEFAULT_MATCH_THRESHOLD,
            detector_score_threshold: 0.5,
            warmup_frames: 4,
            frames_per_capture: 1,
            verify_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load from `FACEID_CONFIG` (or the XDG config file if present), then
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("FACEID_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| xdg_dir("XDG_CONFIG_HOME", ".config").join("faceid/config.toml"));

        let mut config = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `FACEID_*` overrides. Unparseable values are ignored with a warning.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEID_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEID_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEID_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACEID_CAMERA_WIDTH", &mut self.camera_width);
        override_parsed(&lookup, "FACEID_CAMERA_HEIGHT", &mut self.camera_height);
        override_parsed(&lookup, "FACEID_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "FACEID_DETECTOR_SCORE_THRESHOLD", &mut self.detector_score_threshold);
        override_parsed(&lookup, "FACEID_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "FACEID_FRAMES_PER_CAPTURE", &mut self.frames_per_capture);
        override_parsed(&lookup, "FACEID_VERIFY_TIMEOUT_SECS", &mut self.verify_timeout_secs);
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the 128-d recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join("face_recognition_128.onnx")
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!((config.camera_width, config.camera_height), (640, 480));
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.frames_per_capture, 1);
        assert!(config.db_path.ends_with("faceid/faces.db"));
        assert!(config.detector_model_path().ends_with("models/det_10g.onnx"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            camera_device = "/dev/video4"
            match_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert!((config.match_threshold - 0.5).abs() < 1e-6);
        assert_eq!(config.warmup_frames, 4);
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        let path = std::env::temp_dir().join(format!("faceid-config-{}.toml", std::process::id()));
        std::fs::write(&path, "warmup_frames = \"many\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACEID_CAMERA_DEVICE", "/dev/video9"),
            ("FACEID_MATCH_THRESHOLD", "0.45"),
            ("FACEID_FRAMES_PER_CAPTURE", "3"),
            ("FACEID_WARMUP_FRAMES", "lots"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.camera_device, "/dev/video9");
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.frames_per_capture, 3);
        // bad value leaves the default in place
        assert_eq!(config.warmup_frames, 4);
    }
}
