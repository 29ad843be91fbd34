use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mongodb_uri: String,
    pub mongodb_retry_writes: bool,
    pub database_name: String,
    pub candidates_collection: String,
    pub status_collection: String,
    pub status_file: String,
    pub default_batch_size: usize,
    // Prefixed onto bare 10-digit phone numbers, e.g. "91"
    pub default_country_code: Option<String>,
    pub ai: AiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub provider: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub anthropic_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            user_agent: "candidate-ingestion/1.0".to_string(),
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());

        let mongodb_uri = get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".to_string());
        let mongodb_retry_writes: bool = get("MONGODB_RETRY_WRITES").and_then(|s| s.parse().ok()).unwrap_or(false);
        let database_name = get("DATABASE_NAME").unwrap_or_else(|| "candidates".to_string());
        let candidates_collection = get("CANDIDATES_COLLECTION").unwrap_or_else(|| "candidates".to_string());
        let status_collection = get("STATUS_COLLECTION").unwrap_or_else(|| "ingestion_files".to_string());
        let status_file = get("STATUS_FILE").unwrap_or_else(|| ".ingestion-status.json".to_string());
        let default_batch_size: usize = get("DEFAULT_BATCH_SIZE").and_then(|s| s.parse().ok()).unwrap_or(1000);
        let default_country_code = get("DEFAULT_COUNTRY_CODE");

        let http = HttpSettings {
            timeout_ms: get("HTTP_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(60_000),
            user_agent: get("HTTP_USER_AGENT").unwrap_or_else(|| "candidate-ingestion/1.0".to_string()),
            max_retries: get("HTTP_MAX_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(3),
            retry_backoff_ms: get("HTTP_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(500),
        };

        let ai = AiConfig {
            provider: get("AI_PROVIDER").unwrap_or_else(|| "openai".to_string()).to_lowercase(),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            anthropic_model: get("ANTHROPIC_MODEL").unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string()),
            anthropic_base_url: get("ANTHROPIC_BASE_URL").unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            gemini_base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            http,
        };

        Self {
            mongodb_uri,
            mongodb_retry_writes,
            database_name,
            candidates_collection,
            status_collection,
            status_file,
            default_batch_size,
            default_country_code,
            ai,
        }
    }

    /// Connection string with `retryWrites` forced to the configured value.
    ///
    /// Some deployments reject retryable writes, so the URI is rewritten rather than trusting
    /// whatever the operator pasted in.
    pub fn effective_mongodb_uri(&self) -> String {
        let mut uri = self.mongodb_uri.clone();
        if self.mongodb_retry_writes {
            return uri;
        }
        if uri.contains("retryWrites=") {
            uri = uri
                .replace("retryWrites=true", "retryWrites=false")
                .replace("retryWrites=1", "retryWrites=false");
        } else if uri.contains('?') {
            uri.push_str("&retryWrites=false");
        } else {
            // mongodb://host:port needs a path separator before the query string
            let has_path = uri
                .split_once("://")
                .map(|(_, rest)| rest.contains('/'))
                .unwrap_or(false);
            uri.push_str(if has_path { "?retryWrites=false" } else { "/?retryWrites=false" });
        }
        uri
    }
}
