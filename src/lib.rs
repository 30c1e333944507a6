//! prompt-relay: HTTP relay for a locally loaded language model.
//!
//! Requests are validated, wrapped in the prompt template of the loaded
//! model's family, and run on a single model worker. Results come back either
//! as one `text/plain` body or as a stream of raw text fragments.

pub mod config;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod request;
pub mod server;

pub use config::{Cli, Config};
pub use error::ServiceError;
pub use inference::adapter::ModelFamily;
pub use inference::facade::LanguageModel;
pub use request::{ModelRequest, ModelRequestBody};
pub use server::routes::{build_router, AppState};
