//! LLM-backed planner
//!
//! Re-plans statelessly each round: the evidence gathered so far is rendered
//! into the prompt rather than replayed as provider-specific tool messages,
//! so every provider sees the same picture.

use super::{PlanDecision, PlanningContext, Planner};
use crate::classifier::AGENT_PROFILES;
use crate::llm::{LlmClient, LlmMessage};
use crate::models::{
    canonical_json, truncate_chars, Classification, Message, Role, ToolDescriptor, ToolOutcome,
    TraceEntry,
};
use crate::Result;
use async_trait::async_trait;
use tracing::{debug, info};

const PLANNING_PROMPT: &str = r#"You are a SOC (Security Operations Center) analyst assistant with access to security data tools (alerts, vulnerabilities, misconfigurations, inventory, telemetry).

Work in rounds. Each round, either call the tools you still need or, when the evidence is sufficient, reply with text only and no tool calls.

RULES:
1. Act autonomously. Never ask the user to choose options or to run queries themselves.
2. Calls you make in the same round run in parallel, so only batch calls that do not depend on each other.
3. Do not repeat a call that already appears in the evidence with the same arguments.
4. A failed call is evidence too. Retry with different arguments or work around it.
5. When you stop, your text reply should directly answer the question from the evidence."#;

/// Planner driving any configured LLM provider.
pub struct LlmPlanner {
    client: Box<dyn LlmClient>,
    max_tool_output_chars: usize,
}

impl LlmPlanner {
    pub fn new(client: Box<dyn LlmClient>, max_tool_output_chars: usize) -> Self {
        Self {
            client,
            max_tool_output_chars,
        }
    }

    fn router_prompt() -> String {
        let agents = AGENT_PROFILES
            .iter()
            .map(|p| format!("- {}: {}", p.name, p.description))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are a query router. Given the user's security question, determine which specialist agent(s) should handle it.

Available agents:
{}
- general: Handles queries that don't clearly match any specialist.

ROUTING RULES:
- For simple single-domain questions, return ONE agent name.
- For cross-domain correlation queries (e.g. "correlate alerts with vulnerabilities"), return "correlation".
- For multi-domain questions that need separate answers, return several agent names separated by commas.
- When unsure, prefer "correlation" for complex multi-domain queries.

Respond with ONLY the agent name(s), comma-separated if multiple. Nothing else."#,
            agents
        )
    }

    fn planning_request(&self, ctx: &PlanningContext<'_>) -> String {
        let mut request = format!("User query: {}\n\n", ctx.query);

        request.push_str(&format!(
            "Classification: {} ({})\n",
            ctx.classification.label, ctx.classification.rationale
        ));
        if !ctx.preferred_tools.is_empty() {
            request.push_str(&format!(
                "Suggested tools (advisory, any tool may be used): {}\n",
                ctx.preferred_tools.join(", ")
            ));
        }
        request.push_str(&format!("Planning round {} of {}.", ctx.round, ctx.max_rounds));
        if ctx.is_last_round() {
            request.push_str(" This is the last round in which tool results will be seen.");
        }
        request.push_str("\n\n");

        if ctx.evidence.is_empty() {
            request.push_str("No tools have been called yet.");
        } else {
            request.push_str("Evidence so far:\n");
            request.push_str(&render_evidence(ctx.evidence, self.max_tool_output_chars));
        }
        request
    }
}

fn to_llm_messages(history: &[Message]) -> Vec<LlmMessage> {
    history
        .iter()
        .map(|m| match m.role {
            Role::User => LlmMessage::user(&m.content),
            Role::Assistant => LlmMessage::assistant(&m.content),
        })
        .collect()
}

/// Text rendering of trace entries, one block per call. Each payload is
/// capped at `max_chars`.
pub fn render_evidence(entries: &[TraceEntry], max_chars: usize) -> String {
    entries
        .iter()
        .map(|entry| {
            let header = format!(
                "[#{} round {}] {}({})",
                entry.call.index,
                entry.call.round,
                entry.call.tool,
                canonical_json(&entry.call.arguments)
            );
            let body = match &entry.result.outcome {
                ToolOutcome::Ok { payload } => {
                    let text = match payload {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    format!("ok: {}", truncate_chars(&text, max_chars))
                }
                ToolOutcome::Error { error } => format!("error ({}): {}", error.kind, error.detail),
            };
            match entry.result.duplicate_of {
                Some(original) => format!("{} [same as #{}]\n{}", header, original, body),
                None => format!("{}\n{}", header, body),
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn classify(
        &self,
        query: &str,
        _history: &[Message],
        _tools: &[ToolDescriptor],
    ) -> Result<Classification> {
        let raw = self
            .client
            .simple(&Self::router_prompt(), &format!("User query: {}", query))
            .await?;
        debug!(raw = %raw.trim(), "Router reply");
        Ok(Classification::new(
            raw.trim(),
            "Routed by the reasoning engine from the agent descriptions",
        ))
    }

    async fn propose_next_calls(&self, ctx: &PlanningContext<'_>) -> Result<PlanDecision> {
        let mut messages = to_llm_messages(ctx.history);
        messages.push(LlmMessage::user(self.planning_request(ctx)));

        let reply = self
            .client
            .complete(PLANNING_PROMPT, &messages, ctx.tools)
            .await?;

        info!(
            round = ctx.round,
            proposed = reply.tool_calls.len(),
            "Planner replied"
        );

        if reply.tool_calls.is_empty() {
            Ok(PlanDecision::Done { draft: reply.text })
        } else {
            Ok(PlanDecision::Calls(reply.tool_calls))
        }
    }
}
