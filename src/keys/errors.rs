//! Key pool error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or selecting credentials.
///
/// All of these are pre-flight: they surface before any network call is
/// attempted and are not retryable without changing the pool.
#[derive(Debug, Error)]
pub enum KeyPoolError {
    /// The pool holds no credentials.
    #[error("no API keys loaded; check the .env file")]
    EmptyPool,

    /// Every credential is at or over its rate limit.
    #[error("all API keys have exceeded the rate limit")]
    AllKeysRateLimited,

    /// No credential with this name.
    #[error("API key not found: '{name}'")]
    NotFound { name: String },

    /// Ordinal selector past the end of the pool.
    #[error("invalid key index {index} (pool has {len} keys)")]
    IndexOutOfRange { index: usize, len: usize },

    /// The credential file does not exist.
    #[error(".env file not found at {}; create it next to the application", path.display())]
    SourceMissing { path: PathBuf },

    /// The credential file exists but could not be read.
    #[error("failed to read {}: {reason}", path.display())]
    SourceUnreadable { path: PathBuf, reason: String },

    /// The credential file yielded zero usable credentials.
    #[error("no API key found in {}; add at least one line like API_KEY_1=yourkey", path.display())]
    NoCredentials { path: PathBuf },
}

impl KeyPoolError {
    /// Whether this error comes from loading the credential source rather
    /// than from selection.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            KeyPoolError::SourceMissing { .. }
                | KeyPoolError::SourceUnreadable { .. }
                | KeyPoolError::NoCredentials { .. }
        )
    }
}
