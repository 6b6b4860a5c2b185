//! Anthropic messages client

use super::{send_json, LlmClient, LlmMessage, LlmReply, MAX_OUTPUT_TOKENS};
use crate::models::{ProposedCall, Role, ToolDescriptor};
use crate::tools::schema;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl AnthropicClient {
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
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role { Role::User => "user", Role::Assistant => "assistant" },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": system,
            "messages": wire,
        });
        if !tools.is_empty() {
            body["tools"] = json!(schema::to_anthropic(tools));
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

fn into_reply(response: MessagesResponse) -> LlmReply {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { name, input } => {
                let arguments = if input.is_null() { json!({}) } else { input };
                tool_calls.push(ProposedCall::new(name, arguments));
            }
            ContentBlock::Other => {}
        }
    }

    let text = texts.join("\n");
    LlmReply {
        text: if text.trim().is_empty() { None } else { Some(text) },
        tool_calls,
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(
        &self,
        system: &str,
        messages: &[LlmMessage],
        tools: &[ToolDescriptor],
    ) -> Result<LlmReply> {
        debug!(model = %self.model, tools = tools.len(), "Calling Anthropic");
        let request = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.build_body(system, messages, tools));

        let response: MessagesResponse = send_json("anthropic", request).await?;
        Ok(into_reply(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_mixes_text_and_tool_use() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [
                { "type": "text", "text": "Checking alerts first." },
                { "type": "tool_use", "id": "tu_1", "name": "list_alerts", "input": { "limit": 25 } },
                { "type": "thinking", "thinking": "..." }
            ],
            "stop_reason": "tool_use"
        }))
        .unwrap();

        let reply = into_reply(response);
        assert_eq!(reply.text.as_deref(), Some("Checking alerts first."));
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].arguments["limit"], 25);
    }
}
