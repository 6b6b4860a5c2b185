//! Gemini API client
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use super::{parse_arguments, send_json, LlmClient, LlmMessage, LlmReply, MAX_OUTPUT_TOKENS};
use crate::models::{ProposedCall, Role, ToolDescriptor};
use crate::tools::schema;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(client: Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_request(
        system: &str,
        messages: &[LlmMessage],
        tools: &[ToolDescriptor],
    ) -> GeminiRequest {
        GeminiRequest {
            system_instruction: SystemInstruction {
                parts: vec![Part::text(system)],
            },
            contents: messages
                .iter()
                .map(|m| Content {
                    role: Some(
                        match m.role {
                            Role::User => "user",
                            Role::Assistant => "model",
                        }
                        .to_string(),
                    ),
                    parts: vec![Part::text(&m.content)],
                })
                .collect(),
            tools: if tools.is_empty() {
                Vec::new()
            } else {
                vec![ToolDeclarations {
                    function_declarations: schema::to_google(tools),
                }]
            },
            generation_config: GenerationConfig {
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: SystemInstruction,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            function_call: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

fn into_reply(response: GeminiResponse) -> LlmReply {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return LlmReply::default();
    };

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.parts {
        if let Some(call) = part.function_call {
            tool_calls.push(ProposedCall::new(call.name, parse_arguments(&call.args)));
        } else if let Some(text) = part.text {
            texts.push(text);
        }
    }

    let text = texts.join("\n");
    LlmReply {
        text: if text.trim().is_empty() { None } else { Some(text) },
        tool_calls,
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn complete(
        &self,
        system: &str,
        messages: &[LlmMessage],
        tools: &[ToolDescriptor],
    ) -> Result<LlmReply> {
        debug!(model = %self.model, tools = tools.len(), "Calling Gemini");
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let request = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::build_request(system, messages, tools));

        let response: GeminiResponse = send_json("google", request).await?;
        Ok(into_reply(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::empty_object_schema;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = GeminiClient::build_request(
            "You are a SOC analyst",
            &[LlmMessage::user("List critical alerts"), LlmMessage::assistant("ok")],
            &[ToolDescriptor::new("list_alerts", "List alerts", empty_object_schema())],
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["tools"][0]["functionDeclarations"][0]["name"], "list_alerts");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn test_function_call_reply() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "functionCall": { "name": "list_vulnerabilities", "args": { "severity": "CRITICAL" } } }]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let reply = into_reply(response);
        assert!(reply.text.is_none());
        assert_eq!(reply.tool_calls[0].tool, "list_vulnerabilities");
    }
}
