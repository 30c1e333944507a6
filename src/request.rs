//! Completion request: wire shape, defaults and validation.

use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::ServiceError;
use crate::inference::adapter::{ModelFamily, DEFAULT_END_MARKER};
use crate::inference::completion::CompletionParams;

pub const DEFAULT_TEMPERATURE: f64 = 0.5;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
pub const MAX_TEMPERATURE: f64 = 2.0;

/// Request body as received over HTTP. Omitted fields take the configured
/// defaults when resolved into a [`ModelRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequestBody {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub streaming: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

/// A validated completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_new_tokens: usize,
    pub streaming: bool,
    pub stop: Vec<String>,
}

impl ModelRequest {
    /// Request with the built-in defaults.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            streaming: false,
            stop: vec![DEFAULT_END_MARKER.to_string()],
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    /// Same request with the streaming flag forced to `streaming`.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Resolve a wire body against configured defaults and validate it.
    /// An empty configured stop list means the family's end marker.
    pub fn from_body(
        body: ModelRequestBody,
        defaults: &GenerationConfig,
        family: ModelFamily,
    ) -> Result<Self, ServiceError> {
        let stop = match body.stop {
            Some(stop) => stop,
            None if defaults.stop.is_empty() => vec![family.end_marker().to_string()],
            None => defaults.stop.clone(),
        };

        let request = Self {
            prompt: body.prompt,
            system_prompt: body.system_prompt,
            temperature: body.temperature.unwrap_or(defaults.temperature),
            max_new_tokens: body.max_new_tokens.unwrap_or(defaults.max_new_tokens),
            streaming: body.streaming.unwrap_or(false),
            stop,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if !self.temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(ServiceError::Validation(format!(
                "temperature must be within [0, {MAX_TEMPERATURE}], got {}",
                self.temperature
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(ServiceError::Validation(
                "max_new_tokens must be greater than 0".into(),
            ));
        }
        if self.stop.iter().any(String::is_empty) {
            return Err(ServiceError::Validation(
                "stop sequences must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Parameters for the native engine.
    pub fn completion_params(&self) -> CompletionParams {
        CompletionParams {
            max_tokens: self.max_new_tokens,
            stop: self.stop.clone(),
            temperature: self.temperature,
            stream: self.streaming,
        }
    }
}
