use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::LlmConfig;

/// Failures from the generative backend
#[derive(Debug, thiserror::Error)]
pub enum GenerativeError {
    #[error("generative call timed out after {0:?}")]
    Timeout(Duration),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

/// Text completion and embedding capability used by the cognition pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Generative: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerativeError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerativeError>;
}

/// LLM client for calling language models via Anthropic-compatible API
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_url: Option<String>,
    embedding_model: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
    msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl LlmClient {
    /// Create a new LLM client
    pub fn new(config: &LlmConfig, api_key: &str) -> Result<Self, GenerativeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            embedding_url: config.embedding_url.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    /// Create client from config, with `LLM_BASE_URL`, `LLM_API_KEY` and
    /// `LLM_MODEL` overriding the file values
    pub fn from_env(config: &LlmConfig) -> Result<Self, GenerativeError> {
        let mut config = config.clone();
        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.model = model;
        }
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var(&config.api_key_env))
            .map_err(|_| {
                GenerativeError::NotConfigured(format!(
                    "set LLM_API_KEY or {}",
                    config.api_key_env
                ))
            })?;

        Self::new(&config, &api_key)
    }

    async fn error_from(response: reqwest::Response) -> GenerativeError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => err
                .msg
                .or_else(|| err.error.and_then(|e| e.message))
                .unwrap_or_else(|| "unknown error".to_string()),
            Err(_) => body,
        };
        GenerativeError::Api { status, message }
    }
}

#[async_trait]
impl Generative for LlmClient {
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerativeError> {
        let url = format!("{}/v1/messages", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens,
            temperature,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!(
            model = %self.model,
            prompt_length = prompt.len(),
            "sending LLM request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body = response.text().await?;
        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| GenerativeError::Decode(e.to_string()))?;

        let content = extract_text(&chat_response);

        if let Some(usage) = chat_response.usage {
            info!(
                model = %self.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "LLM response received"
            );
        }

        Ok(content)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerativeError> {
        let url = self
            .embedding_url
            .as_deref()
            .ok_or_else(|| GenerativeError::NotConfigured("embedding_url".to_string()))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.embedding_model,
                input: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body = response.text().await?;
        parse_embedding(&body)
    }
}

fn extract_text(response: &ChatResponse) -> String {
    response
        .content
        .iter()
        .filter(|block| block.content_type == "text")
        .filter_map(|block| block.text.clone())
        .collect::<Vec<_>>()
        .join("")
}

fn parse_embedding(body: &str) -> Result<Vec<f32>, GenerativeError> {
    let parsed: EmbeddingResponse =
        serde_json::from_str(body).map_err(|e| GenerativeError::Decode(e.to_string()))?;
    parsed
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| GenerativeError::Decode("empty embedding data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LlmConfig {
        LlmConfig {
            base_url: "https://api.example.com/".to_string(),
            model: "test-model".to_string(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_llm_client_new() {
        let client = LlmClient::new(&test_config(), "test-key").unwrap();
        assert_eq!(client.base_url, "https://api.example.com");
        assert_eq!(client.api_key, "test-key");
        assert_eq!(client.model, "test-model");
    }

    #[test]
    fn test_chat_request_serialization() {
        let request = ChatRequest {
            model: "test".to_string(),
            max_tokens: 120,
            temperature: 0.8,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "Hello".to_string(),
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["max_tokens"], 120);
        assert_eq!(json["messages"][0]["content"], "Hello");
        assert!(json["temperature"].as_f64().unwrap() > 0.79);
    }

    #[test]
    fn test_chat_response_text_blocks_joined() {
        let json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "[🎸] Heading to "},
                {"type": "tool_use"},
                {"type": "text", "text": "the stage"}
            ],
            "model": "glm-4.7",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;

        let response: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(extract_text(&response), "[🎸] Heading to the stage");
    }

    #[test]
    fn test_parse_embedding() {
        let body = r#"{"data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}]}"#;
        assert_eq!(parse_embedding(body).unwrap(), vec![0.1, 0.2, 0.3]);

        let empty = r#"{"data": []}"#;
        assert!(matches!(parse_embedding(empty), Err(GenerativeError::Decode(_))));
    }

    #[tokio::test]
    async fn test_embed_without_url_is_not_configured() {
        let client = LlmClient::new(&test_config(), "k").unwrap();
        let err = client.embed("hello").await.unwrap_err();
        assert!(matches!(err, GenerativeError::NotConfigured(_)));
    }
}
