//! Conversation state and the query lifecycle.
//!
//! The [`QueryOrchestrator`] owns one logical conversation. It picks a
//! credential from the shared key pool, sends the conversation to the
//! streaming endpoint, drives the accumulator and commits the finished
//! response back into history.

pub mod history;
pub mod orchestrator;
pub mod telemetry;
pub mod types;

// Re-exports for convenience
pub use history::ConversationHistory;
pub use orchestrator::QueryOrchestrator;
pub use telemetry::{HttpTelemetry, NoopTelemetry, TelemetrySink, UsageEvent};
pub use types::{ImageAttachment, QueryOutcome, QueryState};
