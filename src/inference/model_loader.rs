//! Startup model loading.
//!
//! Resolves the configured backend into a ready [`CompletionEngine`]. Any
//! failure here is fatal: the server must not start without a model.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::config::{Backend, ModelConfig};
use crate::inference::completion::{CompletionEngine, EngineError};
use crate::inference::llama_ffi::{ContextParams, LlamaModel, ModelParams};
use crate::inference::scripted::ScriptedEngine;

/// What is known about a model file before loading it.
#[derive(Debug, Clone, Serialize)]
pub struct ModelFileInfo {
    pub path: String,
    pub file_size: u64,
    pub format: String,
}

/// Inspect a model file without loading it.
pub fn inspect(path: &Path) -> Result<ModelFileInfo, EngineError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        EngineError::ModelLoadFailed(format!("model file {}: {e}", path.display()))
    })?;

    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("unknown")
        .to_lowercase();

    Ok(ModelFileInfo {
        path: path.display().to_string(),
        file_size: meta.len(),
        format,
    })
}

/// Load the native engine described by `config`.
pub fn load_engine(config: &ModelConfig) -> Result<Box<dyn CompletionEngine>, EngineError> {
    match config.backend {
        Backend::Llama => {
            let file = inspect(&config.model_path)?;
            info!(
                path = file.path,
                size = file.file_size,
                format = file.format,
                "Loading llama model"
            );

            let model = LlamaModel::load(
                &config.model_path,
                ModelParams {
                    n_gpu_layers: config.n_gpu_layers,
                    ..ModelParams::default()
                },
                ContextParams {
                    n_ctx: config.n_ctx,
                },
            )?;
            info!(
                n_ctx = model.n_ctx(),
                n_gpu_layers = model.params().n_gpu_layers,
                "Llama model ready"
            );
            Ok(Box::new(model))
        }
        Backend::Scripted => {
            if config.script.is_empty() {
                return Err(EngineError::ModelLoadFailed(
                    "scripted backend needs at least one fragment".into(),
                ));
            }
            info!(
                model = %config.model_path.display(),
                fragments = config.script.len(),
                "Using scripted engine"
            );
            Ok(Box::new(ScriptedEngine::new(
                config.model_path.display().to_string(),
                config.script.clone(),
            )))
        }
    }
}
