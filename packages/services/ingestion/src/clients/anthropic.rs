use async_trait::async_trait;
use serde_json::{json, Value};

use crate::clients::{ChatClient, ChatRequest, ChatResponse, JsonHttpClient};
use crate::models::*;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1500;

/// Anthropic Messages API adapter.
pub struct AnthropicChatClient {
    http: JsonHttpClient,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicChatClient {
    pub fn new(http: JsonHttpClient, base_url: String, api_key: String, model: String) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_key, model }
    }
}

#[async_trait]
impl ChatClient for AnthropicChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [{ "role": "user", "content": request.user }]
        });
        let url = format!("{}/messages", self.base_url);
        let result = self
            .http
            .post_json("anthropic", &url, &body, |rb| {
                rb.header("x-api-key", &self.api_key).header("anthropic-version", ANTHROPIC_VERSION)
            })
            .await?;

        // Only text blocks carry the answer; tool/thinking blocks are ignored.
        let text: String = result
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(IngestionError::Ai("anthropic response has no text content".to_string()));
        }
        Ok(ChatResponse { text })
    }
}
