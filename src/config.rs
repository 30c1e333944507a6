//! Runtime configuration for prompt-relay.
//!
//! Configuration is loaded from a JSON file; every section and field is
//! optional and falls back to its default. CLI flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::adapter::ModelFamily;
use crate::request::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_TEMPERATURE, MAX_TEMPERATURE};

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
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "prompt-relay", about = "HTTP relay for a local LLM runtime")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Model file to load (overrides the config file).
    #[arg(long)]
    pub model_path: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Default generation parameters for requests that omit them.
    pub generation: GenerationConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,

    /// Request timeout in seconds. For streams this bounds the wait for each
    /// fragment.
    pub request_timeout_secs: u64,

    /// Requests that may wait for the model worker before callers block.
    pub queue_depth: usize,

    /// Fragments buffered between the model worker and a streaming response.
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 300,
            queue_depth: 16,
            stream_buffer: 32,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Which native engine serves completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// llama.cpp over a GGUF model file.
    #[default]
    Llama,
    /// Replays `model.script`; no model file needed.
    Scripted,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file, or an identifier for the scripted backend.
    pub model_path: PathBuf,

    /// Prompt template family. Inferred from the file name when unset.
    pub family: Option<ModelFamily>,

    /// Native engine backend.
    pub backend: Backend,

    /// Fragments replayed by the scripted backend.
    pub script: Vec<String>,

    /// Context size in tokens.
    pub n_ctx: usize,

    /// Number of GPU layers to offload (-1 = all).
    pub n_gpu_layers: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            family: None,
            backend: Backend::Llama,
            script: Vec::new(),
            n_ctx: 4096,
            n_gpu_layers: -1,
        }
    }
}

impl ModelConfig {
    /// Configured family, else inferred from the file name, else generic.
    pub fn resolved_family(&self) -> ModelFamily {
        self.family
            .or_else(|| ModelFamily::infer_from_path(&self.model_path))
            .unwrap_or(ModelFamily::Generic)
    }
}

/// Default generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,

    pub max_new_tokens: usize,

    /// Default stop sequences; empty means the family's end marker.
    pub stop: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            stop: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply CLI overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(model_path) = &cli.model_path {
            self.model.model_path = model_path.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("server.request_timeout_secs must be > 0".into()));
        }
        if self.server.queue_depth == 0 || self.server.stream_buffer == 0 {
            return Err(ConfigError::Invalid(
                "server.queue_depth and server.stream_buffer must be > 0".into(),
            ));
        }
        let temperature = self.generation.temperature;
        if !temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
            return Err(ConfigError::Invalid(format!(
                "generation.temperature must be within [0, {MAX_TEMPERATURE}]"
            )));
        }
        if self.generation.max_new_tokens == 0 {
            return Err(ConfigError::Invalid("generation.max_new_tokens must be > 0".into()));
        }
        if self.model.n_ctx == 0 {
            return Err(ConfigError::Invalid("model.n_ctx must be > 0".into()));
        }
        if self.model.backend == Backend::Scripted && self.model.script.is_empty() {
            return Err(ConfigError::Invalid(
                "model.script must not be empty for the scripted backend".into(),
            ));
        }
        Ok(())
    }
}
