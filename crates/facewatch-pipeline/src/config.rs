use crate::pipeline::PipelineConfig;
use crate::render::{parse_color, OverlayStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
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
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings, layered: defaults, then TOML file, then `FACEWATCH_*`
/// environment variables. Command-line flags are applied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite face store.
    pub db_path: PathBuf,
    /// Cosine similarity needed to accept a live match.
    pub threshold: f32,
    /// Submit every Nth captured frame for matching.
    pub decimation: u32,
    pub inference_width: u32,
    pub inference_height: u32,
    /// Unknown faces at or below this similarity are not shown.
    pub noise_floor: f32,
    pub idle_poll_ms: u64,
    pub join_timeout_ms: u64,
    /// TTF font for captions. A system font is tried when unset.
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub known_color: String,
    pub unknown_color: String,
    /// Per-label box colour, `"#RRGGBB"`.
    pub label_colors: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("faces.db"),
            threshold: 0.2,
            decimation: 8,
            inference_width: 320,
            inference_height: 240,
            noise_floor: 0.15,
            idle_poll_ms: 1,
            join_timeout_ms: 1000,
            font_path: None,
            font_size: 18.0,
            known_color: "#00ff00".to_string(),
            unknown_color: "#ff0000".to_string(),
            label_colors: BTreeMap::new(),
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
        .join("facewatch")
}

impl Config {
    /// `$XDG_CONFIG_HOME/facewatch/config.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("facewatch")
            .join("config.toml")
    }

    /// Load from `path` (must exist) or from the default path (if present),
    /// then apply the environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `FACEWATCH_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEWATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_FONT_PATH") {
            self.font_path = Some(PathBuf::from(v));
        }
        env_parse(&lookup, "FACEWATCH_THRESHOLD", &mut self.threshold);
        env_parse(&lookup, "FACEWATCH_DECIMATION", &mut self.decimation);
        env_parse(&lookup, "FACEWATCH_NOISE_FLOOR", &mut self.noise_floor);
        env_parse(&lookup, "FACEWATCH_INFERENCE_WIDTH", &mut self.inference_width);
        env_parse(&lookup, "FACEWATCH_INFERENCE_HEIGHT", &mut self.inference_height);
        env_parse(&lookup, "FACEWATCH_IDLE_POLL_MS", &mut self.idle_poll_ms);
        env_parse(&lookup, "FACEWATCH_JOIN_TIMEOUT_MS", &mut self.join_timeout_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(ConfigError::Invalid("camera resolution must be non-zero".into()));
        }
        if self.font_size.is_nan() || self.font_size <= 0.0 {
            return Err(ConfigError::Invalid(format!("font_size must be positive, got {}", self.font_size)));
        }
        self.overlay_style().map(|_| ())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            threshold: self.threshold,
            decimation: self.decimation,
            inference_size: (self.inference_width, self.inference_height),
            noise_floor: self.noise_floor,
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }

    pub fn overlay_style(&self) -> Result<OverlayStyle, ConfigError> {
        let color = |name: &str, value: &str| {
            parse_color(value).ok_or_else(|| ConfigError::Invalid(format!("{name}: malformed colour {value:?}")))
        };
        let labels = self
            .label_colors
            .iter()
            .map(|(label, value)| Ok((label.clone(), color(&format!("label_colors.{label}"), value)?)))
            .collect::<Result<_, ConfigError>>()?;

        Ok(OverlayStyle {
            known: color("known_color", &self.known_color)?,
            unknown: color("unknown_color", &self.unknown_color)?,
            labels,
            font_size: self.font_size,
            ..OverlayStyle::default()
        })
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *field = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}
