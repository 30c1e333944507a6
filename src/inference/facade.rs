//! The model a request talks to: a prompt family bound to one loaded engine.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::error::ServiceError;
use crate::inference::adapter::ModelFamily;
use crate::inference::completion::CompletionEvent;
use crate::inference::engine::{EventResult, InferenceEngine};
use crate::inference::model_loader;
use crate::request::ModelRequest;

/// Output of [`LanguageModel::get_response`].
pub enum ModelResponse {
    Complete(CompletionEvent),
    Stream(CompletionStream),
}

/// Forward-only, single-consumer sequence of completion events.
///
/// Ends after the engine's last event or after the first error. Dropping it
/// before it is exhausted cancels the generation.
pub struct CompletionStream {
    rx: mpsc::Receiver<EventResult>,
    exhausted: bool,
}

impl CompletionStream {
    pub fn new(rx: mpsc::Receiver<EventResult>) -> Self {
        Self {
            rx,
            exhausted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl Stream for CompletionStream {
    type Item = Result<CompletionEvent, ServiceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.exhausted {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.exhausted = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(Err(e))) => {
                self.exhausted = true;
                self.rx.close();
                Poll::Ready(Some(Err(e.into())))
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        if !self.exhausted {
            debug!("Completion stream dropped early, cancelling generation");
        }
    }
}

/// A model family bound to its loaded engine for the process lifetime.
pub struct LanguageModel {
    family: ModelFamily,
    engine: InferenceEngine,
}

impl LanguageModel {
    pub fn new(family: ModelFamily, engine: InferenceEngine) -> Self {
        Self { family, engine }
    }

    /// Load the configured model and start its worker.
    pub fn load(config: &Config) -> Result<Self, ServiceError> {
        let engine = model_loader::load_engine(&config.model)
            .map_err(|e| ServiceError::ModelLoad(e.to_string()))?;
        let engine = InferenceEngine::spawn(
            engine,
            config.server.queue_depth,
            config.server.stream_buffer,
        )
        .map_err(|e| ServiceError::ModelLoad(format!("failed to start model worker: {e}")))?;

        Ok(Self::new(config.model.resolved_family(), engine))
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn model_path(&self) -> &str {
        self.engine.model_path()
    }

    /// Full prompt for `request`, falling back to the family's default
    /// system prompt.
    pub fn build_prompt(&self, request: &ModelRequest) -> String {
        if request.system_prompt.is_some() && !self.family.supports_system_prompt() {
            debug!(family = %self.family, "Family has no system turn, system prompt ignored");
        }
        let system_prompt = request
            .system_prompt
            .as_deref()
            .or(self.family.default_system_prompt());
        self.family.get_prompt(&request.prompt, system_prompt)
    }

    /// One terminal event, or a lazy event stream when `request.streaming`.
    pub async fn get_response(&self, request: &ModelRequest) -> Result<ModelResponse, ServiceError> {
        let prompt = self.build_prompt(request);
        let params = request.completion_params();

        if request.streaming {
            let rx = self.engine.stream(prompt, params).await?;
            Ok(ModelResponse::Stream(CompletionStream::new(rx)))
        } else {
            let event = self.engine.complete(prompt, params).await?;
            Ok(ModelResponse::Complete(event))
        }
    }

    /// Text of the first choice. An event without choices is malformed.
    pub fn extract_text(event: &CompletionEvent) -> Result<&str, ServiceError> {
        event
            .choices
            .first()
            .map(|choice| choice.text.as_str())
            .ok_or_else(|| {
                ServiceError::MalformedResponse(format!("completion {} has no choices", event.id))
            })
    }

    /// Non-streaming completion text for `request`.
    pub async fn invoke(&self, request: &ModelRequest) -> Result<String, ServiceError> {
        let request = request.clone().with_streaming(false);
        match self.get_response(&request).await? {
            ModelResponse::Complete(event) => Self::extract_text(&event).map(str::to_string),
            ModelResponse::Stream(_) => Err(ServiceError::MalformedResponse(
                "expected a single completion".into(),
            )),
        }
    }
}
