//! Tool descriptor conversion into provider function-calling formats.

use crate::models::{empty_object_schema, ToolDescriptor};
use serde_json::{json, Value};

fn parameters(tool: &ToolDescriptor) -> Value {
    match &tool.input_schema {
        Value::Object(map) if !map.is_empty() => tool.input_schema.clone(),
        _ => empty_object_schema(),
    }
}

/// OpenAI `tools` array entries.
pub fn to_openai(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": parameters(tool),
                }
            })
        })
        .collect()
}

/// Anthropic `tools` array entries.
pub fn to_anthropic(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": parameters(tool),
            })
        })
        .collect()
}

/// Google `functionDeclarations` entries. Gemini rejects
/// `additionalProperties`, so it is stripped at the top level.
pub fn to_google(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut params = parameters(tool);
            if let Some(map) = params.as_object_mut() {
                map.remove("additionalProperties");
            }
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": params,
            })
        })
        .collect()
}
