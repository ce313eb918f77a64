//! Types shared by the query orchestrator and its callers.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use crate::inference::types::InlineData;
use crate::inference::QueryError;

// ─── Query State ─────────────────────────────────────────────────────────────

/// Lifecycle of one query.
///
/// `Idle → Sending → Streaming → {Completed | Errored | Cancelled} → Idle`.
/// A pre-flight failure goes straight from `Sending` to `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Completed | QueryState::Errored | QueryState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, QueryState::Sending | QueryState::Streaming)
    }
}

// ─── Query Outcome ───────────────────────────────────────────────────────────

/// How a query ended, returned alongside the sink callbacks.
#[derive(Debug)]
pub enum QueryOutcome {
    /// The full response text, also appended to history as a model turn.
    Completed { text: String },
    /// The query failed. The sink has already received `on_error`.
    Failed(QueryError),
    /// Cancelled by the caller or superseded by a newer query.
    Cancelled,
}

impl QueryOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, QueryOutcome::Completed { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            QueryOutcome::Completed { text } => Some(text),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            QueryOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

// ─── Image Attachment ────────────────────────────────────────────────────────

/// Base64-encoded image ready to be sent as inline data.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    mime_type: String,
    data: String,
}

impl ImageAttachment {
    /// Encode raw image bytes.
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    /// Wrap data that is already base64-encoded.
    pub fn from_base64(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read an image file; the media type comes from its extension.
    pub fn from_file(path: &Path) -> Result<Self, QueryError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let mime_type = mime_type_for_extension(ext).ok_or_else(|| {
            QueryError::InvalidAttachment {
                reason: format!("unsupported image type: {}", path.display()),
            }
        })?;

        let bytes = std::fs::read(path).map_err(|e| QueryError::InvalidAttachment {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        if bytes.is_empty() {
            return Err(QueryError::InvalidAttachment {
                reason: format!("{} is empty", path.display()),
            });
        }

        Ok(Self::from_bytes(mime_type, &bytes))
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn into_inline_data(self) -> InlineData {
        InlineData {
            mime_type: self.mime_type,
            data: self.data,
        }
    }
}

impl std::fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("mime_type", &self.mime_type)
            .field("encoded_len", &self.data.len())
            .finish()
    }
}

fn mime_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
