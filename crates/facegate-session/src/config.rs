use facegate_core::{DetectorOptions, DistanceMetric, ReferenceSource};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gate configuration: TOML file (optional) overlaid with `FACEGATE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// V4L2 device path of the user-facing camera.
    pub camera_device: String,
    pub detector: DetectorOptions,
    /// Verification loop cadence.
    pub poll_interval_ms: u64,
    /// Maximum distance (exclusive) for a match.
    pub match_threshold: f32,
    pub distance_metric: DistanceMetric,
    /// Bound on model load, enrollment and camera acquisition; 0 disables.
    pub stage_timeout_secs: u64,
    /// Where to send the user after a successful verification.
    pub destination: String,
    /// Session-scoped store for the verified label.
    pub store_path: PathBuf,
    /// Base directory for relative reference image paths.
    pub reference_dir: PathBuf,
    pub references: Vec<ReferenceSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: data_dir().join("models"),
            camera_device: "/dev/video0".to_string(),
            detector: DetectorOptions::default(),
            poll_interval_ms: 900,
            match_threshold: 0.45,
            distance_metric: DistanceMetric::Euclidean,
            stage_timeout_secs: 30,
            destination: "./letter.html".to_string(),
            store_path: runtime_dir().join("session.json"),
            reference_dir: PathBuf::from("."),
            references: vec![
                ReferenceSource::new("a", "known/a.jpg"),
                ReferenceSource::new("b", "known/b.jpg"),
            ],
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("facegate")
}

impl Config {
    /// Load from `path` (if given), then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Overlay `FACEGATE_*` variables resolved through `lookup`.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);

        if let Some(v) = env.string("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env.string("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env.string("FACEGATE_DESTINATION") {
            self.destination = v;
        }
        if let Some(v) = env.string("FACEGATE_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = env.string("FACEGATE_REFERENCE_DIR") {
            self.reference_dir = PathBuf::from(v);
        }
        env.parse("FACEGATE_DETECTOR_INPUT_SIZE", &mut self.detector.input_size);
        env.parse("FACEGATE_DETECTOR_SCORE_THRESHOLD", &mut self.detector.score_threshold);
        env.parse("FACEGATE_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env.parse("FACEGATE_MATCH_THRESHOLD", &mut self.match_threshold);
        env.parse("FACEGATE_DISTANCE_METRIC", &mut self.distance_metric);
        env.parse("FACEGATE_STAGE_TIMEOUT_SECS", &mut self.stage_timeout_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.match_threshold > 0.0) {
            return invalid(format!("match_threshold must be > 0, got {}", self.match_threshold));
        }
        if !(self.detector.score_threshold > 0.0 && self.detector.score_threshold < 1.0) {
            return invalid(format!(
                "detector.score_threshold must be in (0, 1), got {}",
                self.detector.score_threshold
            ));
        }
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return invalid(format!(
                "detector.input_size must be a positive multiple of 32, got {}",
                self.detector.input_size
            ));
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0".into());
        }
        if self.references.is_empty() {
            return invalid("at least one reference image is required".into());
        }
        if let Some(r) = self.references.iter().find(|r| r.label.trim().is_empty()) {
            return invalid(format!("reference {} has an empty label", r.image));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }

    /// The subset of configuration the session controller runs on.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            poll_interval: self.poll_interval(),
            match_threshold: self.match_threshold,
            distance_metric: self.distance_metric,
            stage_timeout: self.stage_timeout(),
            destination: self.destination.clone(),
            references: self.references.clone(),
        }
    }
}

/// Fixed parameters of a [`SessionController`](crate::SessionController).
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub match_threshold: f32,
    pub distance_metric: DistanceMetric,
    pub stage_timeout: Option<Duration>,
    pub destination: String,
    pub references: Vec<ReferenceSource>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Config::default().session_settings()
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, target: &mut T) {
        let Some(raw) = self.string(key) else {
            return;
        };
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}
