//! Query error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility. These types carry the context needed to
//! build meaningful log entries and the user-facing message shown by the UI.

use thiserror::Error;

use crate::keys::KeyPoolError;

/// Errors that can occur while issuing or streaming a query.
///
/// Cancellation is not an error: a cancelled query ends silently.
#[derive(Debug, Error)]
pub enum QueryError {
    /// No usable credential (empty pool or all rate-limited). Raised before
    /// any network call.
    #[error(transparent)]
    KeyPool(#[from] KeyPoolError),

    /// Network-level failure while connecting, sending, or reading the stream.
    #[error("API request error: {reason}")]
    TransportFault { reason: String },

    /// The request did not complete within the configured timeout.
    #[error("API request timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response. The body is surfaced verbatim.
    #[error("API Error: {status} - {body}")]
    HttpError { status: u16, body: String },

    /// One `data:` record could not be parsed. Reported, never fatal.
    #[error("JSON parsing error: {reason}")]
    MalformedFragment { reason: String },

    /// The stream finished without producing any text.
    #[error("API did not respond or returned an empty response.")]
    EmptyResponse,

    /// The image attached to a query could not be read or is unsupported.
    #[error("invalid attachment: {reason}")]
    InvalidAttachment { reason: String },

    /// Settings loading, validation, or client construction error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl QueryError {
    /// Whether this error was raised before the request was sent.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            QueryError::KeyPool(_)
                | QueryError::InvalidAttachment { .. }
                | QueryError::ConfigError { .. }
        )
    }

    /// Extract the response body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            QueryError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Map a `reqwest` failure onto the transport taxonomy.
    pub(crate) fn from_reqwest(err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            QueryError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            QueryError::TransportFault {
                reason: describe_reqwest_error(err),
            }
        }
    }
}

/// Render a reqwest error with its source chain, which carries the useful
/// detail (DNS failure, connection refused, TLS) for connect errors.
fn describe_reqwest_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str("\nDetails: ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
