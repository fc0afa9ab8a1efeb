use crate::detector::{DetectionParams, DEFAULT_MIN_NEIGHBORS, DEFAULT_MIN_SIZE, DEFAULT_SCALE_FACTOR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Places OpenCV installs its bundled frontal-face cascade.
const CASCADE_CANDIDATES: &[&str] = &[
    "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
    "/usr/local/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
    "/usr/share/opencv/haarcascades/haarcascade_frontalface_default.xml",
    "/usr/local/share/opencv/haarcascades/haarcascade_frontalface_default.xml",
    "/opt/homebrew/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
];

pub const DEFAULT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Sorter configuration.
///
/// Layered as defaults, then an optional TOML file, then `FACESORT_*`
/// environment variables; the CLI applies its flags on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory whose images are sorted.
    pub source_dir: PathBuf,
    /// Destination for images with at least one detected face.
    pub with_face_dir: PathBuf,
    /// Destination for images without a detected face.
    pub without_face_dir: PathBuf,
    /// OpenCV Haar cascade XML.
    pub cascade_path: PathBuf,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Minimum face side in pixels.
    pub min_window_size: u32,
    /// Extensions (without dot) treated as images, case-insensitively.
    pub allowed_extensions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("photos"),
            with_face_dir: PathBuf::from("with_face"),
            without_face_dir: PathBuf::from("without_face"),
            cascade_path: default_cascade_path(),
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_window_size: DEFAULT_MIN_SIZE,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Defaults overridden by `FACESORT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a TOML file; keys it omits keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Override fields from `FACESORT_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from any key lookup using the `FACESORT_*` names.
    ///
    /// Numeric values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FACESORT_SOURCE_DIR") {
            self.source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACESORT_WITH_FACE_DIR") {
            self.with_face_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACESORT_WITHOUT_FACE_DIR") {
            self.without_face_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACESORT_CASCADE") {
            self.cascade_path = PathBuf::from(v);
        }
        self.scale_factor = parsed(&lookup, "FACESORT_SCALE_FACTOR", self.scale_factor);
        self.min_neighbors = parsed(&lookup, "FACESORT_MIN_NEIGHBORS", self.min_neighbors);
        self.min_window_size = parsed(&lookup, "FACESORT_MIN_WINDOW_SIZE", self.min_window_size);
        if let Some(v) = lookup("FACESORT_EXTENSIONS") {
            self.allowed_extensions = v
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
    }

    /// Reject parameter combinations the detector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.scale_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scale_factor must be greater than 1.0, got {}",
                self.scale_factor
            )));
        }
        if self.min_window_size == 0 {
            return Err(ConfigError::Invalid("min_window_size must be > 0".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid("allowed_extensions is empty".into()));
        }
        if self.with_face_dir == self.without_face_dir {
            return Err(ConfigError::Invalid(format!(
                "with_face_dir and without_face_dir are both {}",
                self.with_face_dir.display()
            )));
        }
        Ok(())
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_window_size,
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// First installed OpenCV frontal-face cascade, or the conventional path.
pub fn default_cascade_path() -> PathBuf {
    CASCADE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(CASCADE_CANDIDATES[0]))
}
