//! Deterministic engine that replays a fixed list of fragments.
//!
//! Each fragment counts as one token. Stop sequences and the token budget
//! are applied exactly as for a real model, so the HTTP surface can be
//! exercised without a model file.

use crate::inference::completion::{
    Completion, CompletionEngine, CompletionEvent, CompletionParams, EngineError, FinishReason,
    StopMatcher,
};

pub struct ScriptedEngine {
    model_path: String,
    fragments: Vec<String>,
    prompts: Vec<String>,
    calls: usize,
}

impl ScriptedEngine {
    pub fn new<I, S>(model_path: impl Into<String>, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            model_path: model_path.into(),
            fragments: fragments.into_iter().map(Into::into).collect(),
            prompts: Vec::new(),
            calls: 0,
        }
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    /// Build the event sequence for one call.
    fn events(&self, id: &str, params: &CompletionParams) -> Vec<CompletionEvent> {
        let mut matcher = StopMatcher::new(&params.stop);
        let mut events = Vec::new();
        let mut finish = FinishReason::Stop;

        for (n, fragment) in self.fragments.iter().enumerate() {
            if n >= params.max_tokens {
                finish = FinishReason::Length;
                break;
            }
            let scan = matcher.push(fragment);
            if !scan.emit.is_empty() {
                events.push(CompletionEvent::single(id, &self.model_path, scan.emit, None));
            }
            if scan.stopped {
                events.push(CompletionEvent::single(id, &self.model_path, "", Some(finish)));
                return events;
            }
        }

        events.push(CompletionEvent::single(
            id,
            &self.model_path,
            matcher.finish(),
            Some(finish),
        ));
        events
    }
}

impl CompletionEngine for ScriptedEngine {
    fn model_path(&self) -> &str {
        &self.model_path
    }

    fn complete(
        &mut self,
        prompt: &str,
        params: &CompletionParams,
    ) -> Result<Completion<'_>, EngineError> {
        self.calls += 1;
        self.prompts.push(prompt.to_string());

        let id = format!("cmpl-scripted-{}", self.calls);
        let events = self.events(&id, params);

        if params.stream {
            Ok(Completion::Stream(Box::new(events.into_iter().map(Ok))))
        } else {
            Completion::Stream(Box::new(events.into_iter().map(Ok)))
                .into_single()
                .map(Completion::Single)
        }
    }
}
