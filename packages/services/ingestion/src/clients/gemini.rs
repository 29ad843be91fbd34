use async_trait::async_trait;
use serde_json::{json, Value};

use crate::clients::{ChatClient, ChatRequest, ChatResponse, JsonHttpClient};
use crate::models::*;

/// Google Gemini `generateContent` adapter. The API has no separate system role on this
/// endpoint, so system and user text are sent as one user turn.
pub struct GeminiChatClient {
    http: JsonHttpClient,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiChatClient {
    pub fn new(http: JsonHttpClient, base_url: String, api_key: String, model: String) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_key, model }
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": format!("{}\n\n{}", request.system, request.user) }]
            }],
            "generationConfig": { "temperature": request.temperature }
        });
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let result = self
            .http
            .post_json("gemini", &url, &body, |rb| rb.query(&[("key", self.api_key.as_str())]))
            .await?;

        let text: String = result
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect::<Vec<_>>().join(""))
            .unwrap_or_default();
        if text.is_empty() {
            return Err(IngestionError::Ai("gemini response has no candidate text".to_string()));
        }
        Ok(ChatResponse { text })
    }
}
