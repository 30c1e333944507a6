//! Binding to the llama.cpp runtime.
//!
//! The handle types mirror the llama.cpp model/context split. Until the C
//! library is linked in, generation is a deterministic stand-in: the model
//! "answers" by echoing the readable words of its prompt, one token per word,
//! which keeps the token budget, stop sequences and streaming behaviour
//! observable end to end.

use std::path::Path;

use tracing::debug;
use uuid::Uuid;

use crate::inference::completion::{
    Completion, CompletionEngine, CompletionEvent, CompletionParams, EngineError, FinishReason,
    StopMatcher,
};

/// Token ID type.
pub type TokenId = i32;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of GPU layers to offload.
    pub n_gpu_layers: i32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: -1, // all layers
            use_mmap: true,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self { n_ctx: 4096 }
    }
}

/// Loaded model plus its single evaluation context.
pub struct LlamaModel {
    path: String,
    params: ModelParams,
    n_ctx: usize,
}

impl LlamaModel {
    /// Load a model from a GGUF file.
    pub fn load(
        path: &Path,
        params: ModelParams,
        ctx: ContextParams,
    ) -> Result<Self, EngineError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| EngineError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(EngineError::ModelLoadFailed(format!(
                "{}: not a model file",
                path.display()
            )));
        }
        if ctx.n_ctx == 0 {
            return Err(EngineError::ModelLoadFailed("n_ctx must be positive".into()));
        }

        debug!(
            path = %path.display(),
            n_gpu_layers = params.n_gpu_layers,
            use_mmap = params.use_mmap,
            n_ctx = ctx.n_ctx,
            "llama model loaded"
        );

        Ok(Self {
            path: path.display().to_string(),
            params,
            n_ctx: ctx.n_ctx,
        })
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Tokenize a string into token IDs (approximately 1 token per 4 bytes).
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let n_tokens = text.len().div_ceil(4);
        let mut tokens: Vec<TokenId> = (0..n_tokens as TokenId).collect();
        if add_bos {
            tokens.insert(0, 1); // BOS token
        }
        tokens
    }

    /// Words the stand-in decoder will produce for `prompt`, control
    /// tokens (`<|...|>`) removed.
    fn reply_words(prompt: &str) -> Vec<String> {
        let mut plain = String::with_capacity(prompt.len());
        let mut rest = prompt;
        while let Some(start) = rest.find("<|") {
            plain.push_str(&rest[..start]);
            plain.push(' ');
            match rest[start..].find("|>") {
                Some(end) => rest = &rest[start + end + 2..],
                None => {
                    rest = "";
                }
            }
        }
        plain.push_str(rest);
        plain.split_whitespace().map(str::to_string).collect()
    }
}

/// Decode loop state for one generation.
struct Generation {
    id: String,
    model: String,
    words: std::vec::IntoIter<String>,
    budget: usize,
    produced: usize,
    matcher: StopMatcher,
    finished: bool,
}

impl Generation {
    fn event(&self, text: String, finish: Option<FinishReason>) -> CompletionEvent {
        CompletionEvent::single(self.id.clone(), self.model.clone(), text, finish)
    }
}

impl Iterator for Generation {
    type Item = Result<CompletionEvent, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.produced >= self.budget {
                self.finished = true;
                let tail = self.matcher.finish();
                return Some(Ok(self.event(tail, Some(FinishReason::Length))));
            }

            let Some(word) = self.words.next() else {
                self.finished = true;
                let tail = self.matcher.finish();
                return Some(Ok(self.event(tail, Some(FinishReason::Stop))));
            };

            let piece = if self.produced == 0 {
                word
            } else {
                format!(" {word}")
            };
            self.produced += 1;

            let scan = self.matcher.push(&piece);
            if scan.stopped {
                self.finished = true;
                return Some(Ok(self.event(scan.emit, Some(FinishReason::Stop))));
            }
            if !scan.emit.is_empty() {
                return Some(Ok(self.event(scan.emit, None)));
            }
        }
    }
}

impl CompletionEngine for LlamaModel {
    fn model_path(&self) -> &str {
        &self.path
    }

    fn complete(
        &mut self,
        prompt: &str,
        params: &CompletionParams,
    ) -> Result<Completion<'_>, EngineError> {
        let prompt_tokens = self.tokenize(prompt, true).len();
        if prompt_tokens >= self.n_ctx {
            return Err(EngineError::ContextOverflow {
                prompt_tokens,
                n_ctx: self.n_ctx,
            });
        }

        let generation = Generation {
            id: format!("cmpl-{}", Uuid::new_v4()),
            model: self.path.clone(),
            words: Self::reply_words(prompt).into_iter(),
            budget: params.max_tokens.min(self.n_ctx - prompt_tokens),
            produced: 0,
            matcher: StopMatcher::new(&params.stop),
            finished: false,
        };

        debug!(
            prompt_tokens,
            max_tokens = generation.budget,
            temperature = params.temperature,
            stream = params.stream,
            "llama completion"
        );

        if params.stream {
            Ok(Completion::Stream(Box::new(generation)))
        } else {
            Completion::Stream(Box::new(generation))
                .into_single()
                .map(Completion::Single)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_file() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        std::fs::write(file.path(), b"GGUF\x03\x00\x00\x00").unwrap();
        file
    }

    fn params(max_tokens: usize, stop: &[&str], stream: bool) -> CompletionParams {
        CompletionParams {
            max_tokens,
            stop: stop.iter().map(|s| s.to_string()).collect(),
            temperature: 0.0,
            stream,
        }
    }

    fn text_of(completion: Completion<'_>) -> String {
        match completion {
            Completion::Single(event) => event.choices[0].text.clone(),
            Completion::Stream(_) => panic!("expected a single completion"),
        }
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = LlamaModel::load(
            Path::new("/nonexistent/model.gguf"),
            ModelParams::default(),
            ContextParams::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::ModelLoadFailed(_)));
    }

    #[test]
    fn test_load_empty_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = LlamaModel::load(file.path(), ModelParams::default(), ContextParams::default());
        assert!(matches!(result, Err(EngineError::ModelLoadFailed(_))));
    }

    #[test]
    fn test_load_keeps_params() {
        let file = model_file();
        let model = LlamaModel::load(
            file.path(),
            ModelParams {
                n_gpu_layers: 8,
                ..ModelParams::default()
            },
            ContextParams { n_ctx: 512 },
        )
        .unwrap();
        assert_eq!(model.n_ctx(), 512);
        assert_eq!(model.params().n_gpu_layers, 8);
    }

    #[test]
    fn test_tokenize_stub() {
        let file = model_file();
        let model =
            LlamaModel::load(file.path(), ModelParams::default(), ContextParams::default()).unwrap();
        let tokens = model.tokenize("Hello, world!", true);
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], 1); // BOS
    }

    #[test]
    fn test_reply_strips_control_tokens() {
        let words = LlamaModel::reply_words("<|user|>\nHello there<|end|>\n<|assistant|>");
        assert_eq!(words, vec!["Hello", "there"]);
    }

    #[test]
    fn test_max_tokens_truncates() {
        let file = model_file();
        let mut model =
            LlamaModel::load(file.path(), ModelParams::default(), ContextParams::default()).unwrap();
        let out = model
            .complete("one two three four", &params(2, &[], false))
            .unwrap();
        assert_eq!(text_of(out), "one two");
    }

    #[test]
    fn test_stop_sequence_truncates() {
        let file = model_file();
        let mut model =
            LlamaModel::load(file.path(), ModelParams::default(), ContextParams::default()).unwrap();
        let out = model
            .complete("alpha beta gamma", &params(10, &["gam"], false))
            .unwrap();
        assert_eq!(text_of(out), "alpha beta ");
    }

    #[test]
    fn test_stream_matches_single() {
        let file = model_file();
        let mut model =
            LlamaModel::load(file.path(), ModelParams::default(), ContextParams::default()).unwrap();

        let single = text_of(model.complete("a b c d e", &params(4, &["d"], false)).unwrap());

        let streamed: String = match model.complete("a b c d e", &params(4, &["d"], true)).unwrap() {
            Completion::Stream(events) => events
                .map(|e| e.unwrap().choices[0].text.clone())
                .collect(),
            Completion::Single(_) => panic!("expected a stream"),
        };

        assert_eq!(single, "a b c ");
        assert_eq!(streamed, single);
    }

    #[test]
    fn test_prompt_larger_than_context_fails() {
        let file = model_file();
        let mut model = LlamaModel::load(
            file.path(),
            ModelParams::default(),
            ContextParams { n_ctx: 4 },
        )
        .unwrap();
        let err = model
            .complete("this prompt is far too long for four tokens", &params(8, &[], false))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ContextOverflow { .. }));
    }
}
