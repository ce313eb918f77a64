//! User settings: selected model, endpoint, rate limit, telemetry identity.
//!
//! Persisted as `settings.json` in the app data directory. Missing files are
//! created with defaults; unparseable files fall back to defaults with a
//! warning rather than blocking startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::QueryError;
use super::types::{GenerationConfig, ThinkingConfig};
use crate::keys::RateLimit;

// ─── Defaults ────────────────────────────────────────────────────────────────

const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL_NAME: &str = "Gemini 2.5 Flash";
const DEFAULT_MODEL_ID: &str = "gemini-2.5-flash-preview-04-17";
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_USES: u32 = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

const SETTINGS_FILE: &str = "settings.json";

// ─── Public Types ────────────────────────────────────────────────────────────

/// A model the user can pick from the menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOption {
    pub display_name: String,
    pub model_id: String,
    /// When set, sent as `generationConfig.thinkingConfig.thinkingBudget`.
    /// The plain Flash entry uses `0` to turn thinking off.
    #[serde(default)]
    pub thinking_budget: Option<i32>,
}

impl ModelOption {
    pub fn new(display_name: &str, model_id: &str, thinking_budget: Option<i32>) -> Self {
        Self {
            display_name: display_name.to_string(),
            model_id: model_id.to_string(),
            thinking_budget,
        }
    }

    /// The `generationConfig` object to send with this model, if any.
    pub fn generation_config(&self) -> Option<GenerationConfig> {
        self.thinking_budget.map(|budget| GenerationConfig {
            thinking_config: Some(ThinkingConfig {
                thinking_budget: budget,
            }),
            response_mime_type: None,
        })
    }
}

fn default_models() -> Vec<ModelOption> {
    vec![
        ModelOption::new("Gemini 2.5 Flash", "gemini-2.5-flash-preview-04-17", Some(0)),
        ModelOption::new("Gemini 2.5 Flash Thinking", "gemini-2.5-flash-preview-04-17", None),
        ModelOption::new("Gemini 2.0 Flash Lite", "gemini-2.0-flash-lite-001", None),
        ModelOption::new("Gemini 2.0 Flash Thinking", "gemini-2.0-flash-thinking-exp-01-21", None),
        ModelOption::new("Gemini 2.5 Pro", "gemini-2.5-pro-exp-03-25", None),
    ]
}

/// Persisted application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub selected_model_id: String,
    pub selected_model_name: String,
    pub available_models: Vec<ModelOption>,
    pub api_base_url: String,
    /// Usage-logging endpoint. `None` disables telemetry.
    pub telemetry_url: Option<String>,
    /// Anonymous install identifier, generated on first load.
    pub user_id: String,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_uses: u32,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selected_model_id: DEFAULT_MODEL_ID.to_string(),
            selected_model_name: DEFAULT_MODEL_NAME.to_string(),
            available_models: default_models(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            telemetry_url: None,
            user_id: String::new(),
            rate_limit_window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            rate_limit_max_uses: DEFAULT_RATE_LIMIT_MAX_USES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Default settings location in the platform data directory.
    pub fn default_path() -> PathBuf {
        crate::data_dir().join(SETTINGS_FILE)
    }

    /// Load from disk or return defaults.
    ///
    /// A missing file is created. A user id is generated and persisted if
    /// absent.
    pub fn load_or_default(path: &Path) -> Self {
        let mut settings = if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<Self>(&content) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "loaded settings");
                        cfg
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to parse settings, using defaults");
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read settings, using defaults");
                    Self::default()
                }
            }
        } else {
            tracing::info!(path = %path.display(), "no settings file, creating defaults");
            Self::default()
        };

        let generated = settings.ensure_user_id();
        if generated || !path.exists() {
            if let Err(e) = settings.save(path) {
                tracing::warn!(error = %e, "failed to persist settings");
            }
        }

        settings
    }

    /// Save to disk (atomic write).
    pub fn save(&self, path: &Path) -> Result<(), QueryError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| QueryError::ConfigError {
            reason: format!("failed to serialize settings: {e}"),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueryError::ConfigError {
                reason: format!("failed to create {}: {e}", parent.display()),
            })?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|e| QueryError::ConfigError {
            reason: format!("failed to write {}: {e}", tmp_path.display()),
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| QueryError::ConfigError {
            reason: format!("failed to rename {}: {e}", tmp_path.display()),
        })?;
        tracing::debug!(path = %path.display(), "saved settings");
        Ok(())
    }

    /// Generate a user id if none is set. Returns `true` if one was created.
    pub fn ensure_user_id(&mut self) -> bool {
        if !self.user_id.trim().is_empty() {
            return false;
        }
        self.user_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(user_id = %self.user_id, "new user id created");
        true
    }

    /// Reject values that would make every request fail.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.selected_model_id.trim().is_empty() {
            return Err(QueryError::ConfigError {
                reason: "no model selected".into(),
            });
        }
        if self.api_base_url.trim().is_empty() {
            return Err(QueryError::ConfigError {
                reason: "apiBaseUrl is empty".into(),
            });
        }
        if self.rate_limit_max_uses == 0 {
            return Err(QueryError::ConfigError {
                reason: "rateLimitMaxUses must be at least 1".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(QueryError::ConfigError {
                reason: "requestTimeoutSecs must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// The currently selected model.
    ///
    /// Matched by display name first (two entries can share a model id),
    /// then by id. An id missing from the menu is used as-is.
    pub fn selected_model(&self) -> ModelOption {
        self.available_models
            .iter()
            .find(|m| {
                m.display_name == self.selected_model_name && m.model_id == self.selected_model_id
            })
            .or_else(|| {
                self.available_models
                    .iter()
                    .find(|m| m.model_id == self.selected_model_id)
            })
            .cloned()
            .unwrap_or_else(|| ModelOption {
                display_name: self.selected_model_name.clone(),
                model_id: self.selected_model_id.clone(),
                thinking_budget: None,
            })
    }

    /// Switch the selected model by display name.
    pub fn set_selected_model(&mut self, display_name: &str) -> Result<ModelOption, QueryError> {
        let model = self
            .available_models
            .iter()
            .find(|m| m.display_name.eq_ignore_ascii_case(display_name))
            .cloned()
            .ok_or_else(|| QueryError::ConfigError {
                reason: format!("model '{display_name}' is not in the model list"),
            })?;
        self.selected_model_name = model.display_name.clone();
        self.selected_model_id = model.model_id.clone();
        Ok(model)
    }

    /// Model ids the telemetry endpoint accepts.
    pub fn known_model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .available_models
            .iter()
            .map(|m| m.model_id.clone())
            .collect();
        ids.dedup();
        ids
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit::new(
            Duration::from_secs(self.rate_limit_window_secs),
            self.rate_limit_max_uses,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
