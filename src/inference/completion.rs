//! Native completion capability.
//!
//! [`CompletionEngine`] is the seam to the native runtime: one call turns a
//! formatted prompt into either a single terminal [`CompletionEvent`] or a
//! lazy sequence of partial events. Implementations are driven from a single
//! worker thread and need not be reentrant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Prompt of {prompt_tokens} tokens exceeds context window of {n_ctx}")]
    ContextOverflow { prompt_tokens: usize, n_ctx: usize },
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop sequence was produced or the model ended its turn.
    Stop,
    /// The token budget was exhausted.
    Length,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: Option<FinishReason>,
}

/// One unit of model output: the whole completion, or one fragment of a
/// stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub id: String,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

impl CompletionEvent {
    /// Build an event with a single choice.
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        text: impl Into<String>,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                text: text.into(),
                finish_reason,
            }],
        }
    }

    /// Finish reason of the first choice, if any.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|c| c.finish_reason)
    }
}

/// Generation parameters passed to the native engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub temperature: f64,
    pub stream: bool,
}

/// Lazy, single-pass event sequence borrowed from the engine.
pub type EventIter<'a> = Box<dyn Iterator<Item = Result<CompletionEvent, EngineError>> + 'a>;

/// Output of [`CompletionEngine::complete`].
pub enum Completion<'a> {
    Single(CompletionEvent),
    Stream(EventIter<'a>),
}

impl<'a> Completion<'a> {
    /// Collapse into one terminal event, draining a stream if necessary.
    pub fn into_single(self) -> Result<CompletionEvent, EngineError> {
        match self {
            Completion::Single(event) => Ok(event),
            Completion::Stream(events) => {
                let mut merged: Option<CompletionEvent> = None;
                for event in events {
                    let event = event?;
                    match merged.as_mut() {
                        None => merged = Some(event),
                        Some(acc) => {
                            if let (Some(into), Some(from)) =
                                (acc.choices.first_mut(), event.choices.into_iter().next())
                            {
                                into.text.push_str(&from.text);
                                into.finish_reason = from.finish_reason.or(into.finish_reason);
                            }
                        }
                    }
                }
                merged.ok_or_else(|| EngineError::DecodeFailed("engine produced no events".into()))
            }
        }
    }
}

/// The native completion capability.
pub trait CompletionEngine: Send {
    /// Path or identifier of the loaded model.
    fn model_path(&self) -> &str;

    /// Run one completion. With `params.stream` set, return
    /// [`Completion::Stream`]; otherwise [`Completion::Single`].
    fn complete(
        &mut self,
        prompt: &str,
        params: &CompletionParams,
    ) -> Result<Completion<'_>, EngineError>;
}

/// Result of feeding a fragment to a [`StopMatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scan {
    /// Text that is safe to emit now.
    pub emit: String,
    /// A stop sequence matched; nothing after it may be emitted.
    pub stopped: bool,
}

/// Incremental stop-sequence detection over a fragment stream.
///
/// Text that could be the start of a stop sequence is held back until the
/// next fragment decides it. Output never contains a stop sequence or
/// anything after one.
#[derive(Debug, Clone)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) -> Scan {
        self.pending.push_str(fragment);

        let first_stop = self
            .stops
            .iter()
            .filter_map(|s| self.pending.find(s.as_str()))
            .min();

        if let Some(pos) = first_stop {
            let emit = self.pending[..pos].to_string();
            self.pending.clear();
            return Scan {
                emit,
                stopped: true,
            };
        }

        // Earliest suffix that is a proper prefix of some stop sequence.
        let hold_from = self
            .pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.pending[i..];
                self.stops.iter().any(|s| s.starts_with(tail))
            })
            .unwrap_or(self.pending.len());

        let held = self.pending.split_off(hold_from);
        let emit = std::mem::replace(&mut self.pending, held);
        Scan {
            emit,
            stopped: false,
        }
    }

    /// Release held-back text once the stream ends without a match.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Apply stop sequences to a complete text.
pub fn truncate_at_stop(text: &str, stops: &[String]) -> (String, bool) {
    let mut matcher = StopMatcher::new(stops);
    let scan = matcher.push(text);
    if scan.stopped {
        (scan.emit, true)
    } else {
        (scan.emit + &matcher.finish(), false)
    }
}
