//! chatrelay - SSE-aware HTTP relay for Azure OpenAI chat completions
//!
//! The relay accepts OpenAI-style chat-completion requests, forwards them to
//! a configured Azure deployment and streams the response back, reframing
//! each upstream SSE line as it arrives.

pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod testing;

pub use error::RelayError;
