//! Gemini streaming client.
//!
//! Sends `streamGenerateContent` requests and hands back the raw byte stream
//! once response headers arrive. Parsing lives in [`super::streaming`].

use std::time::Duration;

use futures::{Stream, TryStreamExt};
use reqwest::Client as HttpClient;

use super::config::Settings;
use super::errors::QueryError;
use super::types::GenerateContentRequest;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the credential. Keeps the key out of URLs and logs.
const API_KEY_HEADER: &str = "x-goog-api-key";

// ─── GeminiClient ────────────────────────────────────────────────────────────

/// HTTP client for the generative-language endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: HttpClient,
    base_url: String,
    /// Overall ceiling for one request, streaming included.
    request_timeout: Duration,
}

impl GeminiClient {
    /// Create a client from settings. Does NOT check connectivity.
    pub fn from_settings(settings: &Settings) -> Result<Self, QueryError> {
        Self::new(&settings.api_base_url, settings.request_timeout())
    }

    /// Create a client against an explicit base URL, e.g.
    /// `https://generativelanguage.googleapis.com/v1beta`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, QueryError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| QueryError::ConfigError {
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Streaming endpoint for a model.
    pub fn stream_url(&self, model_id: &str) -> String {
        format!(
            "{}/models/{model_id}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }

    // ─── Streaming request ───────────────────────────────────────────────

    /// Send a streaming request.
    ///
    /// Resolves once headers are received. A non-2xx status is returned as
    /// `HttpError` with the body read verbatim. Turn the response into a
    /// byte stream with [`body_stream`](Self::body_stream).
    pub async fn stream_generate(
        &self,
        model_id: &str,
        api_key: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, QueryError> {
        let url = self.stream_url(model_id);

        // Log the request metadata (not the body; it may carry images)
        tracing::info!(
            url = %url,
            model = %model_id,
            turns = body.contents.len(),
            has_image = body.contents.iter().any(|c| c.has_inline_data()),
            has_generation_config = body.generation_config.is_some(),
            "=== GEMINI REQUEST ==="
        );

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, api_key)
            .header("Accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| QueryError::from_reqwest(&e, self.request_timeout.as_secs()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "API returned non-success status");
            return Err(QueryError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(response)
    }

    /// The response body as a stream of byte chunks, read errors mapped onto
    /// the transport taxonomy.
    pub fn body_stream(
        &self,
        response: reqwest::Response,
    ) -> impl Stream<Item = Result<impl AsRef<[u8]>, QueryError>> {
        let timeout_secs = self.request_timeout.as_secs();
        response
            .bytes_stream()
            .map_err(move |e| QueryError::from_reqwest(&e, timeout_secs))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
