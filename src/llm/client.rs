use crate::error::{FinancialReportError, Result};
use crate::llm::types::TextGenerator;
use async_trait::async_trait;
use log::debug;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// [`TextGenerator`] backed by the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiTextGenerator {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiTextGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Reads `GEMINI_API_KEY` and, optionally, `GEMINI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| FinancialReportError::Config("GEMINI_API_KEY is not set".to_string()))?;
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> FinancialReportError {
    if e.is_timeout() {
        FinancialReportError::UpstreamTimeout(timeout)
    } else {
        FinancialReportError::UpstreamContent(format!("request failed: {}", e))
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str, timeout: Duration) -> FinancialReportError {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            FinancialReportError::UpstreamRateLimit { retry_after }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            FinancialReportError::UpstreamTimeout(timeout)
        }
        _ => FinancialReportError::UpstreamContent(format!(
            "Gemini API error (status {}): {}",
            status, body
        )),
    }
}

#[async_trait]
impl TextGenerator for GeminiTextGenerator {
    async fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                max_output_tokens: max_tokens,
            },
        };

        let res = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let status = res.status();

        if !status.is_success() {
            let retry_after = res
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let err_text = res.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &err_text, timeout));
        }

        let body: GenerateContentResponse = res
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let text: String = body
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .ok_or_else(|| {
                FinancialReportError::UpstreamContent("No candidates returned".to_string())
            })?
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect();

        debug!("Gemini returned {} characters", text.len());
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
