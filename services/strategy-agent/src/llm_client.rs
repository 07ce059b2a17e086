//! OpenAI-compatible chat completion client
//!
//! Used by the LLM composer to turn a prompt into a JSON trade plan. Any
//! provider exposing `/chat/completions` with bearer auth works.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::LlmModelConfig;

/// Default timeout for completion requests (60 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to connect to LLM endpoint {url}: {message}")]
    Connect { url: String, message: String },

    #[error("LLM rate limited ({status}): {body}")]
    RateLimited { status: u16, body: String },

    #[error("LLM request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("LLM not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    /// Quota and rate-limit failures, including ones only visible in the text
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. }) || is_rate_limit_message(&self.to_string())
    }
}

/// Matches the markers providers use for quota exhaustion
pub fn is_rate_limit_message(message: &str) -> bool {
    message.contains("429")
        || message.contains("RESOURCE_EXHAUSTED")
        || message.to_lowercase().contains("quota")
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// Chat model that returns raw text for a system + user prompt
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Provider/model label for logs and rationales
    fn describe(&self) -> String;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `/chat/completions` endpoints
pub struct OpenAiCompatibleClient {
    base_url: String,
    api_key: Option<String>,
    provider: String,
    model_id: String,
    http_client: Client,
    timeout: Duration,
}

impl OpenAiCompatibleClient {
    /// Build from strategy config; the endpoint comes from `base_url` or
    /// the provider's well-known URL
    pub fn new(config: &LlmModelConfig) -> Result<Self> {
        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None => default_base_url(&config.provider)
                .ok_or_else(|| {
                    LlmError::NotConfigured(format!(
                        "no base_url for provider '{}'",
                        config.provider
                    ))
                })?
                .to_string(),
        };
        Self::with_base_url(config, base_url)
    }

    pub fn with_base_url(config: &LlmModelConfig, base_url: impl Into<String>) -> Result<Self> {
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("HTTP client: {}", e)))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        info!(
            "LLM client initialized: provider={}, model={}, url={}",
            config.provider, config.model_id, base_url
        );

        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            provider: config.provider.clone(),
            model_id: config.model_id.clone(),
            http_client,
            timeout,
        })
    }
}

fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "siliconflow" => Some("https://api.siliconflow.cn/v1"),
        _ => None,
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.2,
        };

        debug!("Requesting completion from {} ({} prompt chars)", url, user.len());

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout)
            } else {
                LlmError::Connect {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("LLM returned error: status={}, body={}", status, text);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                LlmError::RateLimited {
                    status: status.as_u16(),
                    body: text,
                }
            } else {
                LlmError::Api {
                    status: status.as_u16(),
                    body: text,
                }
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("decode failed: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("no message content".into()))
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> LlmModelConfig {
        LlmModelConfig {
            provider: "custom".into(),
            model_id: "test-model".into(),
            api_key: Some("sk-test".into()),
            base_url: None,
        }
    }

    #[test]
    fn test_unknown_provider_requires_base_url() {
        assert!(matches!(
            OpenAiCompatibleClient::new(&config()),
            Err(LlmError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(is_rate_limit_message("status 429"));
        assert!(is_rate_limit_message("RESOURCE_EXHAUSTED: try later"));
        assert!(is_rate_limit_message("You exceeded your current Quota"));
        assert!(!is_rate_limit_message("connection reset"));
    }

    #[tokio::test]
    async fn test_complete_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"items\":[]}"}}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::with_base_url(&config(), server.uri()).unwrap();
        let out = client.complete("sys", "user").await.unwrap();
        assert_eq!(out, "{\"items\":[]}");
        assert_eq!(client.describe(), "custom/test-model");
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::with_base_url(&config(), server.uri()).unwrap();
        let err = client.complete("sys", "user").await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { status: 429, .. }));
        assert!(err.is_rate_limit());
    }
}
