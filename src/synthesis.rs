//! Result synthesis
//!
//! Turns the evidence of a finished turn into the answer text. Every
//! recorded result reaches the synthesizer, failed ones included.

use crate::llm::LlmClient;
use crate::memory::format_transcript;
use crate::models::{summarize_args, truncate_chars, Message, ToolOutcome, Trace};
use crate::planner::llm::render_evidence;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

const SYNTHESIS_PROMPT: &str = r#"You are a SOC analyst writing the final answer to an investigation.

You are given the analyst's question, the conversation so far, and every tool call made with its result. Some calls may have failed; say plainly which data could not be retrieved and what that means for the answer.

Answer only from the evidence. When correlating result sets, only name entities that actually appear in all of the relevant sets.
Use markdown with ## headers, tables and bullet lists. Use single backticks for tool and field names."#;

/// Evidence text handed to the LLM is capped at this many chars.
const MAX_EVIDENCE_CHARS: usize = 60_000;

/// Floor for one payload's share of the evidence budget.
const MIN_ENTRY_CHARS: usize = 500;

/// Field names that identify an endpoint in tool payloads.
const ENTITY_KEYS: &[&str] = &[
    "endpoint",
    "endpoint_name",
    "endpointName",
    "hostname",
    "host",
    "computer_name",
    "computerName",
    "agentComputerName",
    "asset",
    "asset_name",
    "assetName",
    "device",
];

pub struct SynthesisInput<'a> {
    pub query: &'a str,
    /// Prior conversation, not including `query`.
    pub history: &'a [Message],
    pub trace: &'a Trace,
    /// Text the planner offered when it stopped, if any.
    pub draft: Option<&'a str>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<String>;
}

/// Deterministic digest of the evidence. Never fails, never empty.
pub struct EvidenceSynthesizer;

impl EvidenceSynthesizer {
    pub fn digest(input: &SynthesisInput<'_>) -> String {
        let entries = input.trace.entries();
        let mut out = String::new();

        if let Some(draft) = input.draft.filter(|d| !d.trim().is_empty()) {
            out.push_str(draft.trim());
            out.push_str("\n\n");
        }

        if entries.is_empty() {
            if out.is_empty() {
                out.push_str(&format!(
                    "No security data was queried to answer \"{}\".",
                    truncate_chars(input.query.trim(), 200)
                ));
                if let Some(last) = input.history.last() {
                    out.push_str(&format!(
                        " The previous reply in this conversation was:\n\n{}",
                        truncate_chars(&last.content, 500)
                    ));
                }
            }
            return out.trim_end().to_string();
        }

        out.push_str("## Evidence\n\n");
        out.push_str("| # | Tool | Arguments | Result |\n");
        out.push_str("|---|------|-----------|--------|\n");
        for entry in entries {
            let result = match (&entry.result.outcome, entry.result.duplicate_of) {
                (_, Some(original)) => format!("same as #{}", original),
                (ToolOutcome::Ok { payload }, None) => describe_payload(payload),
                (ToolOutcome::Error { error }, None) => {
                    format!("failed ({}): {}", error.kind, truncate_chars(&error.detail, 80))
                }
            };
            out.push_str(&format!(
                "| {} | `{}` | {} | {} |\n",
                entry.call.index,
                entry.call.tool,
                summarize_args(&entry.call.arguments),
                result
            ));
        }
        out.push('\n');

        // One entity set per distinct successful tool.
        let mut sets: Vec<(String, BTreeSet<String>)> = Vec::new();
        for entry in entries.iter().filter(|e| e.result.duplicate_of.is_none()) {
            if let ToolOutcome::Ok { payload } = &entry.result.outcome {
                let names = entity_names(payload);
                match sets.iter_mut().find(|(tool, _)| *tool == entry.call.tool) {
                    Some((_, existing)) => existing.extend(names),
                    None => sets.push((entry.call.tool.clone(), names)),
                }
            }
        }
        sets.retain(|(_, names)| !names.is_empty());

        match sets.len() {
            0 => {}
            1 => {
                let (tool, names) = &sets[0];
                out.push_str(&format!(
                    "**Endpoints in `{}`:** {}\n\n",
                    tool,
                    names.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
            }
            _ => {
                let mut common = sets[0].1.clone();
                for (_, names) in &sets[1..] {
                    common = common.intersection(names).cloned().collect();
                }
                let tools = sets
                    .iter()
                    .map(|(t, _)| format!("`{}`", t))
                    .collect::<Vec<_>>()
                    .join(", ");
                if common.is_empty() {
                    out.push_str(&format!("No endpoint appears in every result set ({}).\n\n", tools));
                } else {
                    out.push_str(&format!(
                        "**Endpoints present in every result set ({}):** {}\n\n",
                        tools,
                        common.into_iter().collect::<Vec<_>>().join(", ")
                    ));
                }
            }
        }

        let failures = input.trace.error_count();
        if failures > 0 {
            out.push_str(&format!(
                "{} of {} tool call(s) failed, so these findings may be incomplete.\n",
                failures,
                entries.len()
            ));
        }

        out.trim_end().to_string()
    }
}

#[async_trait]
impl Synthesizer for EvidenceSynthesizer {
    async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<String> {
        Ok(Self::digest(input))
    }
}

fn describe_payload(payload: &Value) -> String {
    match record_count(payload) {
        Some(n) => format!("{} record(s)", n),
        None => match payload {
            Value::String(s) => truncate_chars(&s.replace(['\n', '|'], " "), 80),
            Value::Null => "no data".to_string(),
            other => truncate_chars(&other.to_string().replace('|', " "), 80),
        },
    }
}

/// Length of the top-level array, or of the first array field of an object.
fn record_count(payload: &Value) -> Option<usize> {
    match payload {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => map.values().find_map(|v| v.as_array().map(Vec::len)),
        _ => None,
    }
}

fn entity_names(payload: &Value) -> BTreeSet<String> {
    fn walk(value: &Value, out: &mut BTreeSet<String>) {
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    if ENTITY_KEYS.contains(&key.as_str()) {
                        match v {
                            Value::String(s) if !s.is_empty() => {
                                out.insert(s.clone());
                            }
                            Value::Object(inner) => {
                                if let Some(name) = inner.get("name").and_then(Value::as_str) {
                                    out.insert(name.to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                    walk(v, out);
                }
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            _ => {}
        }
    }

    let mut out = BTreeSet::new();
    walk(payload, &mut out);
    out
}

/// One line per call, never truncated, so failures survive payload cuts.
fn call_statuses(trace: &Trace) -> String {
    trace
        .entries()
        .iter()
        .map(|entry| {
            let status = match (&entry.result.outcome, entry.result.duplicate_of) {
                (_, Some(original)) => format!("same as #{}", original),
                (ToolOutcome::Ok { .. }, None) => "ok".to_string(),
                (ToolOutcome::Error { error }, None) => {
                    format!("error ({}): {}", error.kind, error.detail)
                }
            };
            format!("- #{} `{}`: {}\n", entry.call.index, entry.call.tool, status)
        })
        .collect()
}

/// LLM-written answer over the full evidence.
pub struct LlmSynthesizer {
    client: Box<dyn LlmClient>,
}

impl LlmSynthesizer {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn user_prompt(input: &SynthesisInput<'_>) -> String {
        let mut prompt = format!("User query: {}\n\n", input.query);

        if !input.history.is_empty() {
            prompt.push_str("Conversation so far:\n");
            prompt.push_str(&format_transcript(input.history));
        }

        prompt.push_str(&format!(
            "Classification: {} ({})\n\n",
            input.trace.classification.label, input.trace.classification.rationale
        ));

        if input.trace.entries().is_empty() {
            prompt.push_str("No tools were called. Answer from the conversation.\n");
        } else {
            let entries = input.trace.entries();
            let per_entry = (MAX_EVIDENCE_CHARS / entries.len()).max(MIN_ENTRY_CHARS);
            prompt.push_str("Tool calls and results:\n");
            prompt.push_str(&render_evidence(entries, per_entry));
            prompt.push_str("\n\nStatus of every call:\n");
            prompt.push_str(&call_statuses(input.trace));
            prompt.push('\n');
        }

        if let Some(draft) = input.draft {
            prompt.push_str("Draft answer from the investigating analyst:\n");
            prompt.push_str(draft);
            prompt.push_str("\n\n");
        }

        prompt.push_str("Write the final answer.");
        prompt
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<String> {
        // A clean draft already saw all the evidence.
        if let Some(draft) = input.draft.filter(|d| !d.trim().is_empty()) {
            if input.trace.error_count() == 0 && !input.trace.is_partial() {
                debug!("Using planner draft as the answer");
                return Ok(draft.to_string());
            }
        }

        match self
            .client
            .simple(SYNTHESIS_PROMPT, &Self::user_prompt(input))
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => {
                warn!(error = %e, "LLM synthesis failed, using evidence digest");
                Ok(EvidenceSynthesizer::digest(input))
            }
        }
    }
}
