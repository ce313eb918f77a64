//! Inference: Gemini streaming client and response accumulator.
//!
//! This module handles all communication with the generative-language API:
//! - Request/response schema (`types`)
//! - Settings and model selection (`config`)
//! - The streaming HTTP client (`client`)
//! - SSE line reconstruction and text accumulation (`streaming`)
//!
//! Nothing here knows about conversations or credential rotation; the
//! `conversation` module composes these pieces with the key pool.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::GeminiClient;
pub use config::{ModelOption, Settings};
pub use errors::QueryError;
pub use streaming::{accumulate, LineBuffer, ResponseSink, StreamOutcome};
pub use types::{Content, GenerateContentRequest, GenerationConfig, InlineData, Part, Role};
