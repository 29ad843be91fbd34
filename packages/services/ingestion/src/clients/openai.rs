use async_trait::async_trait;
use serde_json::{json, Value};

use crate::clients::{ChatClient, ChatRequest, ChatResponse, JsonHttpClient};
use crate::models::*;

/// OpenAI-compatible `/chat/completions` adapter.
pub struct OpenAiChatClient {
    http: JsonHttpClient,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatClient {
    pub fn new(http: JsonHttpClient, base_url: String, api_key: String, model: String) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_key, model }
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = json!({
            "model": self.model,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user }
            ]
        });
        let url = format!("{}/chat/completions", self.base_url);
        let result = self
            .http
            .post_json("openai", &url, &body, |rb| rb.bearer_auth(&self.api_key))
            .await?;

        let text = result
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| IngestionError::Ai("openai response has no choices[0].message.content".to_string()))?;
        Ok(ChatResponse { text: text.to_string() })
    }
}
