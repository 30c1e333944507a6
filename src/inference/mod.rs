//! LLM inference.
//!
//! - [`adapter`]: Prompt templates per model family
//! - [`completion`]: Native completion capability and event types
//! - [`engine`]: Model worker that serializes engine access
//! - [`facade`]: Request-facing model (`get_response`, `extract_text`, `invoke`)
//! - [`llama_ffi`]: llama.cpp binding
//! - [`model_loader`]: Startup model loading
//! - [`scripted`]: Deterministic replay engine

pub mod adapter;
pub mod completion;
pub mod engine;
pub mod facade;
pub mod llama_ffi;
pub mod model_loader;
pub mod scripted;
