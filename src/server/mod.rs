//! HTTP server.
//!
//! - [`routes`]: Route handlers and shared state
//! - [`streaming`]: Raw text-fragment streaming bodies

pub mod routes;
pub mod streaming;
