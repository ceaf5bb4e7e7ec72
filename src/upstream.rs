//! Clients for the Gemini `generativelanguage` API.
//!
//! Two integrations implement [`UpstreamClient`]:
//! - [`GeminiRestClient`] sends structured turns. The streaming endpoint
//!   returns cumulative snapshots, which are diffed into increments here.
//! - [`GeminiTranscriptClient`] flattens the conversation into one transcript
//!   turn. Each streamed fragment is already an increment.

use crate::conversion::{to_gemini_request, to_gemini_transcript_request};
use crate::error::{ProxyError, Result};
use crate::models::gemini::{GeminiRequest, GeminiResponse};
use crate::models::TranslationRequest;
use crate::sse::{snapshots_to_increments, GeminiSseDecoder, TextStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    Rest,
    Incremental,
}

impl UpstreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamMode::Rest => "rest",
            UpstreamMode::Incremental => "incremental",
        }
    }
}

/// Upstream model invocation. Implementations own the wire format; callers
/// only hand over a key and a translated request.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn mode(&self) -> UpstreamMode;

    async fn generate(&self, api_key: &str, req: &TranslationRequest) -> Result<GeminiResponse>;

    /// Open a stream of text increments. The upstream status is checked
    /// before this returns.
    async fn generate_stream(&self, api_key: &str, req: &TranslationRequest)
        -> Result<TextStream>;
}

/// Pick the client for `mode`.
pub fn build_upstream(
    mode: UpstreamMode,
    http: reqwest::Client,
    base_url: &str,
) -> Arc<dyn UpstreamClient> {
    let transport = GeminiTransport::new(http, base_url);
    match mode {
        UpstreamMode::Rest => Arc::new(GeminiRestClient { transport }),
        UpstreamMode::Incremental => Arc::new(GeminiTranscriptClient { transport }),
    }
}

/// HTTP plumbing shared by both clients.
struct GeminiTransport {
    http: reqwest::Client,
    base_url: String,
}

impl GeminiTransport {
    fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    fn stream_url(&self, model: &str) -> String {
        format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model)
    }

    async fn post(&self, url: &str, api_key: &str, body: &GeminiRequest) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url, error = %e, "Upstream request failed");
                ProxyError::from(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(url, status = status.as_u16(), body = %text, "Upstream returned error status");
            return Err(ProxyError::Upstream(format!("upstream status {status}")));
        }
        Ok(resp)
    }

    async fn generate(&self, api_key: &str, model: &str, body: &GeminiRequest) -> Result<GeminiResponse> {
        let url = self.generate_url(model);
        let resp = self.post(&url, api_key, body).await?;
        resp.json::<GeminiResponse>().await.map_err(|e| {
            tracing::warn!(url, error = %e, "Upstream body is not a valid response document");
            ProxyError::Upstream(format!("malformed upstream body: {e}"))
        })
    }

    /// Raw text fragments as Gemini sends them.
    async fn fragments(&self, api_key: &str, model: &str, body: &GeminiRequest) -> Result<TextStream> {
        let url = self.stream_url(model);
        let resp = self.post(&url, api_key, body).await?;
        Ok(GeminiSseDecoder::new(Box::pin(resp.bytes_stream())).boxed())
    }
}

/// Structured turns; streamed fragments are cumulative snapshots.
pub struct GeminiRestClient {
    transport: GeminiTransport,
}

impl GeminiRestClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            transport: GeminiTransport::new(http, base_url),
        }
    }
}

#[async_trait]
impl UpstreamClient for GeminiRestClient {
    fn mode(&self) -> UpstreamMode {
        UpstreamMode::Rest
    }

    async fn generate(&self, api_key: &str, req: &TranslationRequest) -> Result<GeminiResponse> {
        self.transport
            .generate(api_key, &req.target_model, &to_gemini_request(req))
            .await
    }

    async fn generate_stream(
        &self,
        api_key: &str,
        req: &TranslationRequest,
    ) -> Result<TextStream> {
        let snapshots = self
            .transport
            .fragments(api_key, &req.target_model, &to_gemini_request(req))
            .await?;
        Ok(snapshots_to_increments(snapshots))
    }
}

/// Single transcript turn; streamed fragments are already deltas.
pub struct GeminiTranscriptClient {
    transport: GeminiTransport,
}

impl GeminiTranscriptClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            transport: GeminiTransport::new(http, base_url),
        }
    }
}

#[async_trait]
impl UpstreamClient for GeminiTranscriptClient {
    fn mode(&self) -> UpstreamMode {
        UpstreamMode::Incremental
    }

    async fn generate(&self, api_key: &str, req: &TranslationRequest) -> Result<GeminiResponse> {
        self.transport
            .generate(api_key, &req.target_model, &to_gemini_transcript_request(req))
            .await
    }

    async fn generate_stream(
        &self,
        api_key: &str,
        req: &TranslationRequest,
    ) -> Result<TextStream> {
        self.transport
            .fragments(api_key, &req.target_model, &to_gemini_transcript_request(req))
            .await
    }
}
