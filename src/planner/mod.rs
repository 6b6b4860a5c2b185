//! Planner trait and implementations
//!
//! The planner is the reasoning engine behind a turn. It labels the query
//! once, then is asked round by round which tool calls to make next given
//! the evidence gathered so far.

use crate::error::OrchestrationError;
use crate::models::{Classification, Message, ProposedCall, ToolDescriptor, TraceEntry};
use crate::Result;
use async_trait::async_trait;

pub mod llm;
pub use llm::LlmPlanner;

/// Everything the planner sees in one planning round.
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub query: &'a str,
    /// Prior conversation, already windowed. Does not include `query`.
    pub history: &'a [Message],
    pub classification: &'a Classification,
    pub tools: &'a [ToolDescriptor],
    /// Calls and results recorded so far in this turn, in index order.
    pub evidence: &'a [TraceEntry],
    /// 1-based.
    pub round: u32,
    pub max_rounds: u32,
    /// Advisory hint from the classification.
    pub preferred_tools: &'a [&'static str],
}

impl PlanningContext<'_> {
    pub fn is_last_round(&self) -> bool {
        self.round >= self.max_rounds
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// Run these next, in proposal order.
    Calls(Vec<ProposedCall>),
    /// Enough evidence. The draft, if any, is a candidate answer.
    Done { draft: Option<String> },
}

impl PlanDecision {
    pub fn done() -> Self {
        PlanDecision::Done { draft: None }
    }

    /// An empty call list is the same as done.
    pub fn from_calls(calls: Vec<ProposedCall>) -> Self {
        if calls.is_empty() {
            Self::done()
        } else {
            PlanDecision::Calls(calls)
        }
    }
}

/// Trait for the reasoning engine (LLM controlled)
#[async_trait]
pub trait Planner: Send + Sync {
    /// Label the query. Callers treat failure here as non-fatal.
    async fn classify(
        &self,
        query: &str,
        history: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<Classification>;

    /// Decide the next calls. `PlannerUnavailable` ends the turn.
    async fn propose_next_calls(&self, ctx: &PlanningContext<'_>) -> Result<PlanDecision>;
}

type ScriptFn = dyn Fn(&PlanningContext<'_>) -> Result<PlanDecision> + Send + Sync;

/// Deterministic planner for development & testing.
/// Keeps the loop exercisable without an LLM.
pub struct ScriptedPlanner {
    classification: Option<Classification>,
    script: Box<ScriptFn>,
}

impl ScriptedPlanner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&PlanningContext<'_>) -> Result<PlanDecision> + Send + Sync + 'static,
    {
        Self {
            classification: Some(Classification::new("general", "scripted")),
            script: Box::new(script),
        }
    }

    /// Round N returns `rounds[N-1]`; past the end it is done.
    pub fn from_rounds(rounds: Vec<Vec<ProposedCall>>) -> Self {
        Self::new(move |ctx| {
            let idx = ctx.round.saturating_sub(1) as usize;
            Ok(rounds
                .get(idx)
                .cloned()
                .map(PlanDecision::from_calls)
                .unwrap_or_else(PlanDecision::done))
        })
    }

    /// Never proposes a call.
    pub fn conversational() -> Self {
        Self::from_rounds(Vec::new())
    }

    /// Proposes a fresh call every round, forever.
    pub fn endless(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self::new(move |ctx| {
            Ok(PlanDecision::Calls(vec![ProposedCall::new(
                tool.clone(),
                serde_json::json!({ "page": ctx.round }),
            )]))
        })
    }

    /// Every planning call fails as if the engine were down.
    pub fn unavailable() -> Self {
        Self::new(|_| {
            Err(OrchestrationError::PlannerUnavailable(
                "scripted outage".to_string(),
            ))
        })
        .without_classification()
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    /// Make `classify` fail.
    pub fn without_classification(mut self) -> Self {
        self.classification = None;
        self
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn classify(
        &self,
        _query: &str,
        _history: &[Message],
        _tools: &[ToolDescriptor],
    ) -> Result<Classification> {
        self.classification.clone().ok_or_else(|| {
            OrchestrationError::PlannerUnavailable("no scripted classification".to_string())
        })
    }

    async fn propose_next_calls(&self, ctx: &PlanningContext<'_>) -> Result<PlanDecision> {
        (self.script)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(classification: &'a Classification, round: u32) -> PlanningContext<'a> {
        PlanningContext {
            query: "q",
            history: &[],
            classification,
            tools: &[],
            evidence: &[],
            round,
            max_rounds: 3,
            preferred_tools: &[],
        }
    }

    #[tokio::test]
    async fn test_scripted_rounds() {
        let planner = ScriptedPlanner::from_rounds(vec![
            vec![ProposedCall::new("list_alerts", json!({}))],
            vec![],
        ]);
        let c = Classification::new("general", "");

        let first = planner.propose_next_calls(&ctx(&c, 1)).await.unwrap();
        assert!(matches!(first, PlanDecision::Calls(ref calls) if calls.len() == 1));

        let second = planner.propose_next_calls(&ctx(&c, 2)).await.unwrap();
        assert_eq!(second, PlanDecision::done());

        let third = planner.propose_next_calls(&ctx(&c, 3)).await.unwrap();
        assert_eq!(third, PlanDecision::done());
        assert!(ctx(&c, 3).is_last_round());
    }

    #[tokio::test]
    async fn test_unavailable_planner() {
        let planner = ScriptedPlanner::unavailable();
        let c = Classification::new("general", "");

        assert!(planner.classify("q", &[], &[]).await.is_err());
        let err = planner.propose_next_calls(&ctx(&c, 1)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
