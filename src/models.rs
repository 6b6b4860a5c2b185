//! Core data models for the investigation orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

//
// ================= Tools =================
//

/// A callable tool as advertised by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Required argument names declared by the JSON schema, if any.
    pub fn required_arguments(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// A call the planner wants made; not yet indexed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ProposedCall {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// 1-based, contiguous within a turn.
    pub index: u32,
    pub round: u32,
    pub tool: String,
    pub arguments: Value,
}

impl ToolCall {
    /// Key used for de-duplication: tool name plus canonical argument JSON.
    pub fn dedup_key(&self) -> (String, String) {
        (self.tool.clone(), canonical_json(&self.arguments))
    }
}

/// JSON rendering with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }

    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Unreachable,
    Timeout,
    InvalidArgument,
    UnknownTool,
    UpstreamRejected,
    Transport,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::Unreachable => "unreachable",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::InvalidArgument => "invalid-argument",
            ToolErrorKind::UnknownTool => "unknown-tool",
            ToolErrorKind::UpstreamRejected => "upstream-rejected",
            ToolErrorKind::Transport => "transport",
        };
        write!(f, "{}", s)
    }
}

/// Structured failure returned by the tool catalog for a single call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub detail: String,
}

impl ToolFailure {
    pub fn new(kind: ToolErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Ok { payload: Value },
    Error { error: ToolFailure },
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    /// Index of the ToolCall this answers.
    pub call_index: u32,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
    pub elapsed_ms: u64,
    /// Set when the outcome was copied from an identical earlier call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<u32>,
}

//
// ================= Classification =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub label: String,
    pub rationale: String,
}

pub const UNCLASSIFIED: &str = "unclassified";

impl Classification {
    pub fn new(label: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            rationale: rationale.into(),
        }
    }

    pub fn unclassified(rationale: impl Into<String>) -> Self {
        Self::new(UNCLASSIFIED, rationale)
    }

    pub fn is_unclassified(&self) -> bool {
        self.label == UNCLASSIFIED
    }
}

//
// ================= Trace =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub call: ToolCall,
    pub result: ToolResult,
}

/// Why the loop stopped planning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The planner signalled it had enough evidence.
    Planner,
    /// The round ceiling was reached.
    RoundLimit,
    /// The wall-clock budget ran out.
    TimeBudget,
}

impl Completion {
    pub fn is_partial(&self) -> bool {
        !matches!(self, Completion::Planner)
    }
}

/// Append-only record of one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub classification: Classification,
    entries: Vec<TraceEntry>,
    pub rounds: u32,
    pub completion: Option<Completion>,
    pub answer: Option<String>,
}

impl Trace {
    pub fn new(classification: Classification) -> Self {
        Self {
            classification,
            entries: Vec::new(),
            rounds: 0,
            completion: None,
            answer: None,
        }
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn next_index(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    /// Append a completed call/result pair. Rejects out-of-order indices and
    /// anything recorded after the answer.
    pub fn record(&mut self, entry: TraceEntry) -> crate::Result<()> {
        if self.answer.is_some() {
            return Err(crate::error::OrchestrationError::PlanningError(
                "trace is sealed; answer already produced".to_string(),
            ));
        }
        if entry.call.index != self.next_index() || entry.result.call_index != entry.call.index {
            return Err(crate::error::OrchestrationError::PlanningError(format!(
                "out-of-order trace entry: expected index {}, got call {} / result {}",
                self.next_index(),
                entry.call.index,
                entry.result.call_index
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn seal(&mut self, answer: String) {
        self.answer = Some(answer);
    }

    pub fn tools_used(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.call.tool.clone()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.result.outcome.is_ok()).count()
    }

    pub fn is_partial(&self) -> bool {
        self.completion.map(|c| c.is_partial()).unwrap_or(false)
    }
}

//
// ================= Turn boundary =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallSummary {
    pub tool: String,
    pub args: Value,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThoughtProcess {
    pub classification: String,
    pub reason: String,
    pub tool_calls: Vec<ToolCallSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub agent: Option<String>,
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_process: Option<ThoughtProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TurnResponse {
    pub fn from_trace(trace: &Trace) -> Self {
        let agent = if trace.classification.is_unclassified() {
            None
        } else {
            Some(trace.classification.label.clone())
        };

        Self {
            status: TurnStatus::Success,
            result: trace.answer.clone(),
            agent,
            tools_used: trace.tools_used().into_iter().collect(),
            thought_process: Some(ThoughtProcess {
                classification: trace.classification.label.clone(),
                reason: trace.classification.rationale.clone(),
                tool_calls: trace
                    .entries()
                    .iter()
                    .map(|e| ToolCallSummary {
                        tool: e.call.tool.clone(),
                        args: e.call.arguments.clone(),
                        summary: summarize_args(&e.call.arguments),
                    })
                    .collect(),
            }),
            partial: Some(trace.is_partial()),
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: TurnStatus::Error,
            result: None,
            agent: None,
            tools_used: Vec::new(),
            thought_process: None,
            partial: None,
            detail: Some(detail.into()),
        }
    }
}

/// Short human form of tool arguments: `key: value, ...`.
pub fn summarize_args(arguments: &Value) -> String {
    const MAX_VALUE: usize = 60;
    const MAX_TOTAL: usize = 120;

    let Some(map) = arguments.as_object() else {
        return truncate_chars(&arguments.to_string(), MAX_TOTAL);
    };

    let parts: Vec<String> = map
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}: {}", k, truncate_chars(&rendered, MAX_VALUE))
        })
        .collect();

    truncate_chars(&parts.join(", "), MAX_TOTAL)
}

/// Cut to `max` chars, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
