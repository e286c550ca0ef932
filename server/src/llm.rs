//! Chat completion clients. The rest of the crate only needs "send
//! messages, get one text back", which is what [`ChatModel`] offers.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

const OPENAI_API_BASE: &str = "https://api.openai.com";
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-2024-08-06";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

const TEMPERATURE: f32 = 1.0;
const MAX_TOKENS: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Gpt,
    Claude,
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelProvider::Gpt => f.write_str("gpt"),
            ModelProvider::Claude => f.write_str("claude"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

pub struct OpenAiChat {
    http: reqwest::Client,
    base: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: OPENAI_API_BASE.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn body(&self, messages: &[ChatMessage]) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
            "top_p": 1,
            "frequency_penalty": 0,
            "presence_penalty": 0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base.trim_end_matches('/'));
        debug!(model = %self.model, messages = messages.len(), "requesting chat completion");
        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.body(messages))
            .send()
            .await?
            .error_for_status()?;
        let response: OpenAiResponse = res.json().await.context("decoding chat completion json")?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completion returned no content"))
    }
}

/// Anthropic Messages API. System turns go in the top-level `system` field
/// rather than the message list.
pub struct AnthropicChat {
    http: reqwest::Client,
    base: String,
    api_key: String,
    model: String,
}

impl AnthropicChat {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: ANTHROPIC_API_BASE.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn body(&self, messages: &[ChatMessage]) -> Value {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
            "system": system,
            "messages": turns,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl ChatModel for AnthropicChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/v1/messages", self.base.trim_end_matches('/'));
        debug!(model = %self.model, messages = messages.len(), "requesting message");
        let res = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(messages))
            .send()
            .await?
            .error_for_status()?;
        let response: AnthropicResponse = res.json().await.context("decoding messages json")?;
        response
            .content
            .into_iter()
            .next()
            .and_then(|block| block.text)
            .ok_or_else(|| anyhow!("message response returned no text"))
    }
}
