//! MCP tool catalog
//!
//! Talks JSON-RPC 2.0 to the remote tool server over streamable HTTP.
//! Replies arrive either as plain JSON or as a `text/event-stream` body.

use super::{ToolCallResult, ToolCatalog};
use crate::error::OrchestrationError;
use crate::models::{empty_object_schema, ToolDescriptor, ToolErrorKind, ToolFailure};
use crate::Result;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "mcp-session-id";
const TOOLS_CACHE_TTL: Duration = Duration::from_secs(300);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on `initialize` and `tools/list`.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct McpTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

struct ToolsCache {
    fetched_at: Instant,
    tools: Vec<ToolDescriptor>,
}

/// Catalog backed by a remote MCP server.
pub struct McpToolCatalog {
    client: Client,
    base_url: String,
    session_id: Mutex<Option<String>>,
    /// Held across the whole handshake so concurrent first calls run it once.
    initialized: Mutex<bool>,
    next_id: AtomicU64,
    tools_cache: RwLock<Option<ToolsCache>>,
}

impl McpToolCatalog {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: Mutex::new(None),
            initialized: Mutex::new(false),
            next_id: AtomicU64::new(1),
            tools_cache: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/mcp", self.base_url)
    }

    async fn post(
        &self,
        request: &JsonRpcRequest<'_>,
        timeout: Duration,
    ) -> std::result::Result<reqwest::Response, ToolFailure> {
        let session = self.session_id.lock().await.clone();

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Accept", "application/json, text/event-stream")
            .timeout(timeout)
            .json(request);
        if let Some(id) = session {
            builder = builder.header(SESSION_HEADER, id);
        }

        builder.send().await.map_err(transport_failure)
    }

    /// Send a request and decode the JSON-RPC envelope.
    async fn rpc(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> std::result::Result<Value, ToolFailure> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed)),
            method,
            params: Some(params),
        };

        let response = self.post(&request, timeout).await?;
        let status = response.status();

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(id.to_string());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        let body = response.text().await.map_err(transport_failure)?;

        if !status.is_success() {
            return Err(ToolFailure::new(
                ToolErrorKind::UpstreamRejected,
                format!("MCP server returned {} for {}", status, method),
            ));
        }

        let envelope = if is_stream {
            parse_event_stream(&body)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).map_err(|e| {
                ToolFailure::new(
                    ToolErrorKind::Transport,
                    format!("invalid JSON-RPC response: {}", e),
                )
            })?
        };

        if let Some(error) = envelope.error {
            return Err(rpc_failure(&error));
        }

        envelope.result.ok_or_else(|| {
            ToolFailure::new(ToolErrorKind::Transport, "JSON-RPC response without result")
        })
    }

    async fn ensure_session(&self) -> std::result::Result<(), ToolFailure> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let init = self
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "spectra-orchestrator", "version": env!("CARGO_PKG_VERSION") },
                }),
                DISCOVERY_TIMEOUT,
            )
            .await?;

        let server = init
            .get("serverInfo")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(server = %server, "MCP session initialized");

        let notification = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: "notifications/initialized",
            params: None,
        };
        // The server does not answer notifications with a body worth reading.
        self.post(&notification, DISCOVERY_TIMEOUT).await?;
        *initialized = true;
        Ok(())
    }

    async fn fetch_tools(&self) -> std::result::Result<Vec<ToolDescriptor>, ToolFailure> {
        self.ensure_session().await?;
        let result = self.rpc("tools/list", json!({}), DISCOVERY_TIMEOUT).await?;

        let tools: Vec<McpTool> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or_else(|| json!([])),
        )
        .map_err(|e| ToolFailure::new(ToolErrorKind::Transport, format!("invalid tools/list: {}", e)))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema.unwrap_or_else(empty_object_schema),
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl ToolCatalog for McpToolCatalog {
    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| OrchestrationError::ToolCatalogUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OrchestrationError::ToolCatalogUnreachable(format!(
                "health endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        {
            let cache = self.tools_cache.read().await;
            if let Some(cache) = cache.as_ref() {
                if cache.fetched_at.elapsed() < TOOLS_CACHE_TTL {
                    return Ok(cache.tools.clone());
                }
            }
        }

        match self.fetch_tools().await {
            Ok(tools) => {
                info!(count = tools.len(), "Discovered MCP tools");
                *self.tools_cache.write().await = Some(ToolsCache {
                    fetched_at: Instant::now(),
                    tools: tools.clone(),
                });
                Ok(tools)
            }
            Err(failure) => {
                // Serve a stale catalog rather than nothing.
                if let Some(cache) = self.tools_cache.read().await.as_ref() {
                    warn!(error = %failure, "Tool discovery failed, using cached catalog");
                    return Ok(cache.tools.clone());
                }
                Err(OrchestrationError::ToolCatalogUnreachable(failure.to_string()))
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> ToolCallResult {
        debug!(tool = %name, "MCP tool call");
        self.ensure_session().await?;

        let result = self
            .rpc(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                CALL_TIMEOUT,
            )
            .await?;

        let text = extract_text(&result);
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ToolFailure::new(ToolErrorKind::UpstreamRejected, text));
        }

        Ok(decode_payload(text, &result))
    }
}

fn transport_failure(error: reqwest::Error) -> ToolFailure {
    let kind = if error.is_connect() {
        ToolErrorKind::Unreachable
    } else if error.is_timeout() {
        ToolErrorKind::Timeout
    } else {
        ToolErrorKind::Transport
    };
    ToolFailure::new(kind, error.to_string())
}

fn rpc_failure(error: &JsonRpcError) -> ToolFailure {
    let kind = match error.code {
        -32602 => ToolErrorKind::InvalidArgument,
        -32601 => ToolErrorKind::UnknownTool,
        _ => ToolErrorKind::UpstreamRejected,
    };
    ToolFailure::new(kind, error.message.clone())
}

/// The last `data:` frame carrying `result` or `error` wins.
fn parse_event_stream(body: &str) -> std::result::Result<JsonRpcResponse, ToolFailure> {
    let mut found = None;
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data) {
            if parsed.result.is_some() || parsed.error.is_some() {
                found = Some(parsed);
            }
        }
    }

    found.ok_or_else(|| {
        ToolFailure::new(ToolErrorKind::Transport, "no valid response in SSE stream")
    })
}

/// Join the `text` content items of a `tools/call` result.
fn extract_text(result: &Value) -> String {
    match result.get("content").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    }
}

/// Prefer structured content, then JSON embedded in the text, then the text itself.
fn decode_payload(text: String, result: &Value) -> Value {
    if let Some(structured) = result.get("structuredContent") {
        return structured.clone();
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(value) if value.is_object() || value.is_array() => value,
        _ => Value::String(text),
    }
}
