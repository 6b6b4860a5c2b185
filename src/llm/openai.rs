//! OpenAI chat completions client

use super::{parse_arguments, send_json, LlmClient, LlmMessage, LlmReply, MAX_OUTPUT_TOKENS};
use crate::models::{ProposedCall, Role, ToolDescriptor};
use crate::tools::schema;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiClient {
    pub fn new(client: Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
            url: DEFAULT_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn build_body(&self, system: &str, messages: &[LlmMessage], tools: &[ToolDescriptor]) -> Value {
        let mut wire = vec![json!({ "role": "system", "content": system })];
        wire.extend(messages.iter().map(|m| {
            json!({
                "role": match m.role { Role::User => "user", Role::Assistant => "assistant" },
                "content": m.content,
            })
        }));

        let mut body = json!({
            "model": self.model,
            "max_completion_tokens": MAX_OUTPUT_TOKENS,
            "messages": wire,
        });
        if !tools.is_empty() {
            body["tools"] = json!(schema::to_openai(tools));
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn into_reply(response: ChatResponse) -> LlmReply {
    let Some(choice) = response.choices.into_iter().next() else {
        return LlmReply::default();
    };

    LlmReply {
        text: choice.message.content.filter(|t| !t.is_empty()),
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ProposedCall::new(c.function.name, parse_arguments(&c.function.arguments)))
            .collect(),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        system: &str,
        messages: &[LlmMessage],
        tools: &[ToolDescriptor],
    ) -> Result<LlmReply> {
        debug!(model = %self.model, tools = tools.len(), "Calling OpenAI");
        let request = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(system, messages, tools));

        let response: ChatResponse = send_json("openai", request).await?;
        Ok(into_reply(response))
    }
}
