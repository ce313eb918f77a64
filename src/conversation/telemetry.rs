//! Usage telemetry.
//!
//! The orchestrator reports one [`UsageEvent`] per dispatched query. Sinks
//! must return immediately and never fail the query.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inference::{QueryError, Settings};

/// Timeout for one telemetry POST.
const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatched query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageEvent {
    pub model_id: String,
    /// Length of the question text in characters.
    pub query_length: usize,
    pub is_image_query: bool,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(model_id: &str, query: &str, is_image_query: bool) -> Self {
        Self {
            model_id: model_id.to_string(),
            query_length: query.chars().count(),
            is_image_query,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for usage events.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: UsageEvent) {}
}

// ─── HTTP Telemetry ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TelemetryPayload<'a> {
    user_id: &'a str,
    request_data: RequestData,
}

#[derive(Debug, Serialize)]
struct RequestData {
    timestamp: String,
    is_image_query: bool,
    query_length: usize,
}

/// Posts usage events to `{endpoint}/telemetry/{model_id}` in the background.
#[derive(Debug, Clone)]
pub struct HttpTelemetry {
    http: reqwest::Client,
    endpoint: String,
    user_id: String,
    known_models: Vec<String>,
}

impl HttpTelemetry {
    pub fn new(
        endpoint: &str,
        user_id: impl Into<String>,
        known_models: Vec<String>,
    ) -> Result<Self, QueryError> {
        let http = reqwest::Client::builder()
            .timeout(TELEMETRY_TIMEOUT)
            .build()
            .map_err(|e| QueryError::ConfigError {
                reason: format!("failed to build telemetry HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            known_models,
        })
    }

    /// Build from settings. `None` when no telemetry endpoint is configured.
    pub fn from_settings(settings: &Settings) -> Option<Result<Self, QueryError>> {
        let endpoint = settings.telemetry_url.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        Some(Self::new(
            endpoint,
            settings.user_id.clone(),
            settings.known_model_ids(),
        ))
    }

    pub fn event_url(&self, model_id: &str) -> String {
        format!("{}/telemetry/{model_id}", self.endpoint)
    }

    /// Whether an event would be sent.
    pub fn accepts(&self, event: &UsageEvent) -> bool {
        !self.user_id.is_empty() && self.known_models.iter().any(|m| m == &event.model_id)
    }

    fn payload(&self, event: &UsageEvent) -> serde_json::Value {
        let payload = TelemetryPayload {
            user_id: &self.user_id,
            request_data: RequestData {
                timestamp: event.timestamp.to_rfc3339(),
                is_image_query: event.is_image_query,
                query_length: event.query_length,
            },
        };
        serde_json::to_value(payload).unwrap_or_default()
    }
}

impl TelemetrySink for HttpTelemetry {
    fn record(&self, event: UsageEvent) {
        if self.user_id.is_empty() {
            tracing::warn!("telemetry skipped: no user id");
            return;
        }
        if !self.accepts(&event) {
            tracing::warn!(model = %event.model_id, "telemetry skipped: unknown model");
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!("telemetry dropped: no async runtime");
                return;
            }
        };

        let url = self.event_url(&event.model_id);
        let body = self.payload(&event);
        let http = self.http.clone();

        handle.spawn(async move {
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(url = %url, "telemetry sent");
                }
                Ok(resp) => {
                    tracing::warn!(
                        url = %url,
                        status = resp.status().as_u16(),
                        "telemetry rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "telemetry request failed");
                }
            }
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
