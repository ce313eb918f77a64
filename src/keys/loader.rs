//! Credential source: a line-oriented `.env` file read once at startup.
//!
//! ```text
//! # comments and blank lines are ignored
//! API_KEY_1=first-key
//! API_KEY_2=second-key
//! OTHER_SETTING=ignored   # only API_KEY_* names become credentials
//! ```

use std::path::{Path, PathBuf};

use super::errors::KeyPoolError;
use super::pool::{Credential, KeyPool};

/// Names must start with this prefix to be accepted as credentials.
pub const CREDENTIAL_PREFIX: &str = "API_KEY_";

/// Environment variable that points at an explicit credential file.
const ENV_FILE_VAR: &str = "GEMINI_OVERLAY_ENV_FILE";

/// Locate the credential file.
///
/// Resolution order:
/// 1. `GEMINI_OVERLAY_ENV_FILE`, if set (returned even if missing, so the
///    load error names the path the user asked for).
/// 2. `.env` next to the executable.
/// 3. `.env` in the current working directory.
///
/// Falls back to the executable-adjacent path when nothing exists.
pub fn find_env_file() -> PathBuf {
    if let Ok(explicit) = std::env::var(ENV_FILE_VAR) {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit);
        }
    }

    let exe_adjacent = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")));

    if let Some(ref candidate) = exe_adjacent {
        if candidate.exists() {
            return candidate.clone();
        }
    }

    let cwd_candidate = std::env::current_dir().unwrap_or_default().join(".env");
    if cwd_candidate.exists() {
        return cwd_candidate;
    }

    exe_adjacent.unwrap_or(cwd_candidate)
}

/// Load a [`KeyPool`] from a credential file.
///
/// Fails with `SourceMissing` if the file does not exist and
/// `NoCredentials` if no line yields a usable credential.
pub fn load_env_file(path: &Path) -> Result<KeyPool, KeyPoolError> {
    if !path.exists() {
        return Err(KeyPoolError::SourceMissing {
            path: path.to_path_buf(),
        });
    }

    let raw = std::fs::read_to_string(path).map_err(|e| KeyPoolError::SourceUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let credentials = parse_env_lines(&raw);
    if credentials.is_empty() {
        return Err(KeyPoolError::NoCredentials {
            path: path.to_path_buf(),
        });
    }

    tracing::info!(
        path = %path.display(),
        keys = credentials.len(),
        names = ?credentials.iter().map(Credential::name).collect::<Vec<_>>(),
        "loaded API keys"
    );

    Ok(KeyPool::new(credentials))
}

/// Parse `NAME=value` lines into credentials, in file order.
fn parse_env_lines(raw: &str) -> Vec<Credential> {
    let mut credentials: Vec<Credential> = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // The value is everything after the first '='; keys may contain '='.
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if !name.starts_with(CREDENTIAL_PREFIX) || value.is_empty() {
            continue;
        }

        if credentials.iter().any(|c| c.name() == name) {
            tracing::warn!(name = %name, "duplicate API key name, keeping the first");
            continue;
        }

        credentials.push(Credential::new(name, value));
    }

    credentials
}

// ─── Tests ───────────────────────────────────────────────────────────────────
