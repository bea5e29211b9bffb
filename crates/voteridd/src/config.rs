use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use voterid_core::{ModelKind, ModelSpec, PipelineConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/voterid/voteridd.toml";
pub const DEFAULT_MODEL_DIR: &str = "/var/lib/voterid/models";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    BadOverride { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// One `[[models]]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelEntry {
    Liveness {
        name: String,
        path: PathBuf,
    },
    Encoder {
        name: String,
        detector_path: PathBuf,
        recognizer_path: PathBuf,
    },
}

impl ModelEntry {
    pub fn name(&self) -> &str {
        match self {
            ModelEntry::Liveness { name, .. } | ModelEntry::Encoder { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelEntry::Liveness { .. } => "liveness",
            ModelEntry::Encoder { .. } => "encoder",
        }
    }
}

/// Daemon configuration: TOML file, then `VOTERID_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base directory for relative model paths.
    pub model_dir: PathBuf,
    /// Catalog name of the liveness model the pipeline uses.
    pub liveness_model: String,
    /// Catalog name of the face encoder the pipeline uses.
    pub encoder_model: String,
    pub models: Vec<ModelEntry>,
    /// Euclidean distance below which two faces match.
    pub match_threshold: f32,
    pub liveness_max_dimension: u32,
    pub encoding_max_dimension: u32,
    pub step_timeout_secs: u64,
    pub worker_threads: usize,
    /// Load the pipeline's models at startup instead of on first request.
    pub preload: bool,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            models: vec![
                ModelEntry::Liveness {
                    name: pipeline.liveness_model.clone(),
                    path: PathBuf::from("anti_spoof.onnx"),
                },
                ModelEntry::Encoder {
                    name: pipeline.encoder_model.clone(),
                    detector_path: PathBuf::from("det_10g.onnx"),
                    recognizer_path: PathBuf::from("w600k_r50.onnx"),
                },
            ],
            liveness_model: pipeline.liveness_model,
            encoder_model: pipeline.encoder_model,
            match_threshold: pipeline.match_threshold,
            liveness_max_dimension: pipeline.liveness_max_dimension,
            encoding_max_dimension: pipeline.encoding_max_dimension,
            step_timeout_secs: pipeline.step_timeout.as_secs(),
            worker_threads: pipeline.worker_threads,
            preload: true,
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load from `VOTERID_CONFIG` (or the default path) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("VOTERID_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Apply `VOTERID_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("VOTERID_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("VOTERID_MATCH_THRESHOLD") {
            self.match_threshold = parse("VOTERID_MATCH_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("VOTERID_STEP_TIMEOUT_SECS") {
            self.step_timeout_secs = parse("VOTERID_STEP_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("VOTERID_WORKER_THREADS") {
            self.worker_threads = parse("VOTERID_WORKER_THREADS", v)?;
        }
        if let Some(v) = lookup("VOTERID_PRELOAD") {
            self.preload = v != "0";
        }
        if let Some(v) = lookup("VOTERID_BUS") {
            self.bus = match v.as_str() {
                "system" => BusKind::System,
                "session" => BusKind::Session,
                _ => {
                    return Err(ConfigError::BadOverride {
                        key: "VOTERID_BUS",
                        value: v,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be positive, got {}",
                self.match_threshold
            )));
        }
        if self.step_timeout_secs == 0 {
            return Err(ConfigError::Invalid("step_timeout_secs must be at least 1".into()));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.liveness_max_dimension == 0 || self.encoding_max_dimension == 0 {
            return Err(ConfigError::Invalid("max dimensions must be non-zero".into()));
        }

        let mut names: Vec<&str> = self.models.iter().map(ModelEntry::name).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(format!("model '{}' listed twice", dup[0])));
        }

        for (role, name, expected) in [
            ("liveness_model", &self.liveness_model, "liveness"),
            ("encoder_model", &self.encoder_model, "encoder"),
        ] {
            let entry = self.models.iter().find(|m| m.name() == name).ok_or_else(|| {
                ConfigError::Invalid(format!("{role} '{name}' has no [[models]] entry"))
            })?;
            if entry.kind() != expected {
                return Err(ConfigError::Invalid(format!(
                    "{role} '{name}' has kind {}, expected {expected}",
                    entry.kind()
                )));
            }
        }
        Ok(())
    }

    /// Registry catalog with relative paths resolved against `model_dir`.
    pub fn catalog(&self) -> Vec<ModelSpec> {
        self.models
            .iter()
            .map(|entry| match entry {
                ModelEntry::Liveness { name, path } => ModelSpec {
                    name: name.clone(),
                    kind: ModelKind::Liveness {
                        path: self.resolve(path),
                    },
                },
                ModelEntry::Encoder {
                    name,
                    detector_path,
                    recognizer_path,
                } => ModelSpec {
                    name: name.clone(),
                    kind: ModelKind::Encoder {
                        detector_path: self.resolve(detector_path),
                        recognizer_path: self.resolve(recognizer_path),
                    },
                },
            })
            .collect()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            liveness_model: self.liveness_model.clone(),
            encoder_model: self.encoder_model.clone(),
            match_threshold: self.match_threshold,
            liveness_max_dimension: self.liveness_max_dimension,
            encoding_max_dimension: self.encoding_max_dimension,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            worker_threads: self.worker_threads,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_dir.join(path)
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::BadOverride { key, value })
}
