//! LLM provider clients
//!
//! One connection-pooled client per provider, all exposing the same
//! `complete` call: system prompt + messages + optional tool definitions in,
//! text and/or tool calls out.

use crate::error::OrchestrationError;
use crate::models::{ProposedCall, Role, ToolDescriptor};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::error;

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;

pub const MAX_OUTPUT_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    OpenAi,
    Anthropic,
    Google,
}

impl LlmProviderKind {
    pub fn key_env_var(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "OPENAI_API_KEY",
            LlmProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            LlmProviderKind::Google => "GEMINI_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "gpt-5.2",
            LlmProviderKind::Anthropic => "claude-sonnet-4-5",
            LlmProviderKind::Google => "gemini-2.5-flash",
        }
    }
}

impl FromStr for LlmProviderKind {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProviderKind::OpenAi),
            "anthropic" => Ok(LlmProviderKind::Anthropic),
            "google" | "gemini" => Ok(LlmProviderKind::Google),
            other => Err(OrchestrationError::ConfigError(format!(
                "unknown LLM provider: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LlmProviderKind::OpenAi => "openai",
            LlmProviderKind::Anthropic => "anthropic",
            LlmProviderKind::Google => "google",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// What the model said back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ProposedCall>,
}

/// Provider-neutral completion call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        messages: &[LlmMessage],
        tools: &[ToolDescriptor],
    ) -> Result<LlmReply>;

    /// Text-only call used for routing and synthesis.
    async fn simple(&self, system: &str, user: &str) -> Result<String> {
        let reply = self
            .complete(system, &[LlmMessage::user(user)], &[])
            .await?;
        reply
            .text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| OrchestrationError::LlmError("empty response".to_string()))
    }
}

/// Build the client for the configured provider.
pub fn create_client(
    kind: LlmProviderKind,
    api_key: String,
    model: String,
) -> Result<Box<dyn LlmClient>> {
    if api_key.trim().is_empty() {
        return Err(OrchestrationError::ConfigError(format!(
            "no API key configured for {} (set LLM_API_KEY or {})",
            kind,
            kind.key_env_var()
        )));
    }

    let http = http_client()?;
    Ok(match kind {
        LlmProviderKind::OpenAi => Box::new(OpenAiClient::new(http, api_key, model)),
        LlmProviderKind::Anthropic => Box::new(AnthropicClient::new(http, api_key, model)),
        LlmProviderKind::Google => Box::new(GeminiClient::new(http, api_key, model)),
    })
}

pub(crate) fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .timeout(Duration::from_secs(120))
        .build()?)
}

/// Send a JSON request, mapping transport and non-2xx replies to
/// `PlannerUnavailable` and decode errors to `LlmError`.
pub(crate) async fn send_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request.send().await.map_err(|e| {
        error!(provider = %provider, error = %e, "LLM request failed");
        OrchestrationError::PlannerUnavailable(format!("{} request failed: {}", provider, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(500).collect();
        error!(provider = %provider, status = %status, "LLM error response");
        return Err(OrchestrationError::PlannerUnavailable(format!(
            "{} returned {}: {}",
            provider, status, snippet
        )));
    }

    response.json::<T>().await.map_err(|e| {
        error!(provider = %provider, error = %e, "Failed to parse LLM response");
        OrchestrationError::LlmError(format!("{} parse error: {}", provider, e))
    })
}

/// Tool arguments sometimes arrive as a JSON string; normalise to an object.
pub(crate) fn parse_arguments(raw: &serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(s) if s.trim().is_empty() => serde_json::json!({}),
        serde_json::Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
        }
        serde_json::Value::Null => serde_json::json!({}),
        other => other.clone(),
    }
}
