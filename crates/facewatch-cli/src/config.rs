use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: defaults, then an optional TOML file, then
/// `FACEWATCH_*` environment variables. Command-line flags win over all three.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Persons database: one subdirectory of face images per identity.
    pub db_path: PathBuf,
    /// Cosine similarity a stored embedding must exceed to match.
    pub similarity_threshold: f32,
    /// Seconds between database folder scans while watching.
    pub watch_interval_secs: u64,
    /// Longest image side fed to the detector (0 = no downscale).
    pub max_image_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
            db_path: PathBuf::from("./media/db"),
            similarity_threshold: 0.40,
            watch_interval_secs: 5,
            max_image_size: 640,
        }
    }
}

impl Config {
    /// Load from `file` (if given) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `FACEWATCH_*` variables; unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&mut self.similarity_threshold, lookup("FACEWATCH_SIMILARITY_THRESHOLD"));
        override_parsed(&mut self.watch_interval_secs, lookup("FACEWATCH_WATCH_INTERVAL_SECS"));
        override_parsed(&mut self.max_image_size, lookup("FACEWATCH_MAX_IMAGE_SIZE"));
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T: std::str::FromStr>(field: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *field = parsed;
    }
}
