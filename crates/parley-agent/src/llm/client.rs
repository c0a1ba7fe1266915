//! LLM client contract and the default HTTP implementation.
//!
//! The core only ever needs two calls: free-text completion and structured
//! completion against a JSON schema.  Everything provider-specific stays
//! behind [`LlmClient`]; tests substitute scripted implementations.
//!
//! [`HttpLlmClient`] speaks the OpenAI-compatible chat-completions dialect
//! served by most hosted and local providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::llm::types::{Message, Role};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The thin LLM surface the orchestration engine depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete `messages` into free text.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Complete `messages` into a JSON value conforming to `schema`.
    ///
    /// Implementations should coerce the model toward JSON output; callers
    /// still validate the value against the schema before trusting it.
    async fn complete_structured(&self, messages: &[Message], schema: &Value) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Configuration for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlmConfig {
    /// API key; sent as a bearer token.
    pub api_key: String,
    /// Base URL, e.g. `https://api.groq.com/openai/v1`.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens per response.
    pub max_tokens: u32,
}

/// [`LlmClient`] over an OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Debug)]
pub struct HttpLlmClient {
    config: Arc<HttpLlmConfig>,
    http: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::ConfigError {
                reason: "llm api key is empty".to_owned(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    async fn chat(&self, messages: &[Message], json_mode: bool) -> Result<String> {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": wire_messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(model = %self.config.model, json_mode, "llm request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AgentError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| AgentError::LlmParseFailed {
                reason: "response has no message content".to_owned(),
            })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.chat(messages, false).await
    }

    async fn complete_structured(&self, messages: &[Message], schema: &Value) -> Result<Value> {
        // Pin the model to the schema through an extra system message; the
        // provider's JSON mode only guarantees syntactic validity.
        let mut prompted = vec![Message::system(format!(
            "Respond with a single JSON object matching this JSON Schema, and nothing else:\n{schema}"
        ))];
        prompted.extend_from_slice(messages);

        let text = self.chat(&prompted, true).await?;
        let json_text = extract_json_block(&text);
        serde_json::from_str(json_text).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("structured output is not valid JSON: {e}"),
        })
    }
}

/// Pull the JSON payload out of a possibly fenced response.
pub(crate) fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}
