pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::*;
pub use gemini::*;
pub use openai::*;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::config::{AiConfig, HttpSettings};
use crate::models::*;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
}

/// Minimal chat-completion seam used by AI header mapping.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
}

/// JSON-over-HTTP transport shared by the provider adapters: bounded exponential backoff on
/// 5xx, 429 and connection errors.
#[derive(Clone)]
pub struct JsonHttpClient {
    client: Client,
    user_agent: String,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl JsonHttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(settings.timeout_ms))
            .connect_timeout(std::time::Duration::from_millis(settings.timeout_ms.min(10_000)))
            .build()?;
        Ok(Self {
            client,
            user_agent: settings.user_agent.clone(),
            max_retries: settings.max_retries,
            base_backoff_ms: settings.retry_backoff_ms,
        })
    }

    /// POSTs `body` to `url`; `decorate` adds provider headers. Returns the parsed JSON body of
    /// the first successful response.
    pub async fn post_json<F>(&self, provider: &str, url: &str, body: &Value, decorate: F) -> Result<Value>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let mut attempt: u32 = 0;
        loop {
            tracing::debug!(provider, attempt = attempt + 1, "chat request: sending");
            let request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("User-Agent", &self.user_agent)
                .json(body);
            let resp_res = decorate(request).send().await;

            match resp_res {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response.json().await?);
                    }
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let transient = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if transient && attempt < self.max_retries {
                        let backoff = self.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
                        tracing::warn!(provider, status = %status, attempt = attempt + 1, backoff_ms = backoff, "chat request transient error; retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    tracing::warn!(provider, status = %status, body_preview = %text.chars().take(200).collect::<String>(), "chat request: non-success response");
                    return Err(IngestionError::Ai(format!("{} error: status={} body={}", provider, status, text)));
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let backoff = self.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
                        tracing::warn!(provider, error = %e, attempt = attempt + 1, backoff_ms = backoff, "chat request error; retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestionError::Ai(format!("{} request error: {}", provider, e)));
                }
            }
        }
    }
}

fn require_key(key: &Option<String>, var: &str) -> Result<String> {
    key.clone()
        .ok_or_else(|| IngestionError::Configuration(format!("{} is required for AI header mapping", var)))
}

/// Builds the adapter named by `AI_PROVIDER`.
pub fn create_chat_client(config: &AiConfig) -> Result<Box<dyn ChatClient>> {
    let http = JsonHttpClient::new(&config.http)?;
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiChatClient::new(
            http,
            config.openai_base_url.clone(),
            require_key(&config.openai_api_key, "OPENAI_API_KEY")?,
            config.openai_model.clone(),
        ))),
        "anthropic" => Ok(Box::new(AnthropicChatClient::new(
            http,
            config.anthropic_base_url.clone(),
            require_key(&config.anthropic_api_key, "ANTHROPIC_API_KEY")?,
            config.anthropic_model.clone(),
        ))),
        "gemini" => Ok(Box::new(GeminiChatClient::new(
            http,
            config.gemini_base_url.clone(),
            require_key(&config.gemini_api_key, "GEMINI_API_KEY")?,
            config.gemini_model.clone(),
        ))),
        other => Err(IngestionError::Configuration(format!("unsupported AI_PROVIDER: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai_config(provider: &str) -> AiConfig {
        AiConfig {
            provider: provider.to_string(),
            openai_api_key: Some("sk".into()),
            openai_model: "m".into(),
            openai_base_url: "http://localhost".into(),
            anthropic_api_key: None,
            anthropic_model: "m".into(),
            anthropic_base_url: "http://localhost".into(),
            gemini_api_key: Some("g".into()),
            gemini_model: "m".into(),
            gemini_base_url: "http://localhost".into(),
            http: HttpSettings::default(),
        }
    }

    #[test]
    fn factory_picks_provider_and_checks_keys() {
        assert!(create_chat_client(&ai_config("openai")).is_ok());
        assert!(create_chat_client(&ai_config("gemini")).is_ok());
        assert!(matches!(
            create_chat_client(&ai_config("anthropic")),
            Err(IngestionError::Configuration(_))
        ));
        assert!(matches!(create_chat_client(&ai_config("llama")), Err(IngestionError::Configuration(_))));
    }
}
