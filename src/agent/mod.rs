//! Main orchestrator - implements the turn loop
//!
//! PLANNING → EXECUTING → PLANNING … → SYNTHESIZING → DONE, with ERROR
//! reachable from any state.

pub mod events;

pub use events::{EventSink, TurnEvent};

use crate::audit::{self, InvestigationRecord, InvestigationStore};
use crate::classifier;
use crate::config::{AppConfig, OrchestratorConfig};
use crate::error::OrchestrationError;
use crate::execution::{DedupCache, RoundExecutor};
use crate::llm::create_client;
use crate::memory::{ContextConfig, ContextManager};
use crate::metrics::MetricsCollector;
use crate::models::{Completion, Message, ToolDescriptor, Trace, TurnResponse};
use crate::planner::{LlmPlanner, PlanDecision, Planner, PlanningContext};
use crate::session::ConversationSession;
use crate::synthesis::{EvidenceSynthesizer, LlmSynthesizer, SynthesisInput, Synthesizer};
use crate::tools::{McpToolCatalog, ToolCatalog};
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Planning,
    Executing,
    Synthesizing,
    Done,
    Error,
}

/// A finished turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub trace: Trace,
    /// Pending investigation write, when a store is configured.
    pub investigation: Option<JoinHandle<Result<Uuid>>>,
}

impl TurnOutcome {
    pub fn response(&self) -> TurnResponse {
        TurnResponse::from_trace(&self.trace)
    }
}

/// Coordinates classification, the plan–execute loop and synthesis.
pub struct Orchestrator {
    catalog: Arc<dyn ToolCatalog>,
    planner: Arc<dyn Planner>,
    synthesizer: Arc<dyn Synthesizer>,
    executor: RoundExecutor,
    context_manager: ContextManager,
    config: OrchestratorConfig,
    store: Option<Arc<dyn InvestigationStore>>,
    metrics: Arc<MetricsCollector>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn ToolCatalog>,
        planner: Arc<dyn Planner>,
        synthesizer: Arc<dyn Synthesizer>,
        config: OrchestratorConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            executor: RoundExecutor::new(Arc::clone(&catalog), &config, Arc::clone(&metrics)),
            context_manager: ContextManager::with_config(ContextConfig::from(&config)),
            catalog,
            planner,
            synthesizer,
            config,
            store: None,
            metrics,
        }
    }

    /// Production wiring: MCP catalog, LLM planner and synthesizer, and the
    /// configured investigation store.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let catalog = Arc::new(McpToolCatalog::new(config.mcp_server_url.clone())?);
        let planner = LlmPlanner::new(
            create_client(config.llm_provider, config.llm_api_key.clone(), config.llm_model.clone())?,
            config.orchestrator.max_tool_output_chars,
        );
        let synthesizer = LlmSynthesizer::new(create_client(
            config.llm_provider,
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )?);

        info!(
            provider = %config.llm_provider,
            model = %config.llm_model,
            mcp = %config.mcp_server_url,
            "Orchestrator configured"
        );

        Ok(Self::new(
            catalog,
            Arc::new(planner),
            Arc::new(synthesizer),
            config.orchestrator.clone(),
        )
        .with_store(audit::build_store(config.database_url.as_deref())))
    }

    pub fn with_store(mut self, store: Arc<dyn InvestigationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn ToolCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> Option<&Arc<dyn InvestigationStore>> {
        self.store.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Run one turn on `session`. Waits for any earlier turn on the same
    /// session to finish first.
    ///
    /// The user and assistant messages are appended together once the
    /// answer exists, so a failed or cancelled turn leaves the conversation
    /// exactly as it was.
    pub async fn run_turn(
        &self,
        session: &ConversationSession,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.run_turn_with_events(session, query, cancel, &EventSink::none())
            .await
    }

    /// `run_turn`, reporting progress to `events`. The last event is always
    /// `result` or `error`.
    pub async fn run_turn_with_events(
        &self,
        session: &ConversationSession,
        query: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<TurnOutcome> {
        let turn_id = Uuid::new_v4();
        let started = Instant::now();
        let _turn = match session.begin_turn().await {
            Ok(guard) => guard,
            Err(e) => {
                events.emit(TurnEvent::Error {
                    status: "error",
                    message: e.user_message(),
                });
                return Err(e);
            }
        };

        info!(
            turn_id = %turn_id,
            session_id = %session.id(),
            query = %query,
            "Orchestrator: starting turn"
        );

        let mut label: Option<String> = None;
        let result = self
            .drive(turn_id, session, query, cancel, events, &mut label)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let agent = label.as_deref().unwrap_or(UNROUTED);

        match result {
            Ok(outcome) => {
                debug!(turn_id = %turn_id, state = ?TurnState::Done, "Turn finished");
                self.metrics.record_agent_call(agent, elapsed_ms, false);
                let response = outcome.response();
                events.emit(TurnEvent::Result {
                    status: "success",
                    result: response.result.clone().unwrap_or_default(),
                    response: Box::new(response),
                });
                Ok(outcome)
            }
            Err(e) => {
                error!(turn_id = %turn_id, state = ?TurnState::Error, error = %e, "Turn failed");
                self.metrics.record_agent_call(agent, elapsed_ms, true);
                events.emit(TurnEvent::Error {
                    status: "error",
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        turn_id: Uuid,
        session: &ConversationSession,
        query: &str,
        cancel: &CancellationToken,
        events: &EventSink,
        label: &mut Option<String>,
    ) -> Result<TurnOutcome> {
        let started = Instant::now();
        events.emit(TurnEvent::OrchestratorStart { status: "classifying" });
        let deadline = tokio::time::Instant::now() + self.config.turn_budget;

        // Refuse to start against a dead catalog. A catalog that stalls past
        // the turn budget counts as dead.
        timeout_at(deadline, cancellable(cancel, self.catalog.health_check()))
            .await
            .map_err(|_| discovery_timed_out("health check"))?
            .map_err(catalog_down)?;
        let tools: Vec<ToolDescriptor> =
            timeout_at(deadline, cancellable(cancel, self.catalog.list_tools()))
                .await
                .map_err(|_| discovery_timed_out("tool discovery"))?
                .map_err(catalog_down)?;

        let snapshot = session.snapshot().await;
        let history = self.context_manager.window(&snapshot);

        let classification = match timeout_at(
            deadline,
            cancellable(cancel, async {
                Ok(classifier::classify_turn(self.planner.as_ref(), query, history, &tools).await)
            }),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => classification_timed_out(),
        };
        let preferred_tools = classifier::preferred_tools(&classification.label);
        self.metrics.record_routing(&classification.label);
        *label = Some(classification.label.clone());
        let agent = classification.label.clone();
        events.emit(TurnEvent::AgentStart {
            agent: agent.clone(),
            status: "starting",
        });

        let mut trace = Trace::new(classification);
        let mut cache = DedupCache::new();
        let mut draft: Option<String> = None;
        let mut state = TurnState::Planning;
        let mut round = 0u32;

        let completion = loop {
            if round >= self.config.max_rounds {
                warn!(turn_id = %turn_id, rounds = round, "Round limit reached, forcing synthesis");
                break Completion::RoundLimit;
            }
            round += 1;
            trace.rounds = round;
            debug!(turn_id = %turn_id, round, state = ?state, "Planning");

            let ctx = PlanningContext {
                query,
                history,
                classification: &trace.classification,
                tools: &tools,
                evidence: trace.entries(),
                round,
                max_rounds: self.config.max_rounds,
                preferred_tools: &preferred_tools,
            };

            let decision = match timeout_at(
                deadline,
                cancellable(cancel, self.planner.propose_next_calls(&ctx)),
            )
            .await
            {
                Ok(decision) => decision?,
                Err(_) => {
                    warn!(turn_id = %turn_id, round, "Turn budget exhausted while planning");
                    break Completion::TimeBudget;
                }
            };

            let calls = match decision {
                PlanDecision::Done { draft: text } => {
                    draft = text;
                    break Completion::Planner;
                }
                PlanDecision::Calls(calls) => calls,
            };

            state = TurnState::Executing;
            debug!(turn_id = %turn_id, round, state = ?state, calls = calls.len(), "Executing");
            let first_index = trace.next_index();
            for (offset, call) in calls.iter().enumerate() {
                events.emit(TurnEvent::ToolCall {
                    agent: agent.clone(),
                    tool: call.tool.clone(),
                    call_index: first_index + offset as u32,
                    round,
                    status: "calling",
                });
            }

            let entries = match timeout_at(
                deadline,
                cancellable(
                    cancel,
                    self.executor
                        .execute_round(round, first_index, calls, &tools, &mut cache),
                ),
            )
            .await
            {
                Ok(entries) => entries?,
                Err(_) => {
                    warn!(turn_id = %turn_id, round, "Turn budget exhausted while executing");
                    break Completion::TimeBudget;
                }
            };

            for entry in entries {
                events.emit(TurnEvent::ToolResult {
                    agent: agent.clone(),
                    tool: entry.call.tool.clone(),
                    call_index: entry.call.index,
                    status: if entry.result.outcome.is_ok() { "complete" } else { "error" },
                    elapsed_ms: entry.result.elapsed_ms,
                    duplicate_of: entry.result.duplicate_of,
                });
                trace.record(entry)?;
            }
            state = TurnState::Planning;
        };

        state = TurnState::Synthesizing;
        trace.completion = Some(completion);
        debug!(turn_id = %turn_id, state = ?state, completion = ?completion, "Synthesizing");

        let answer = {
            let input = SynthesisInput {
                query,
                history,
                trace: &trace,
                draft: draft.as_deref(),
            };
            let text = match cancellable(cancel, self.synthesizer.synthesize(&input)).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => EvidenceSynthesizer::digest(&input),
                Err(OrchestrationError::Cancelled) => return Err(OrchestrationError::Cancelled),
                Err(e) => {
                    warn!(turn_id = %turn_id, error = %e, "Synthesis failed, using evidence digest");
                    EvidenceSynthesizer::digest(&input)
                }
            };
            label_partial(text, completion, &self.config)
        };
        trace.seal(answer.clone());

        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        session.append(Message::user(query)).await?;
        session.append(Message::assistant(answer)).await?;
        events.emit(TurnEvent::AgentComplete {
            agent,
            status: "complete",
        });

        info!(
            turn_id = %turn_id,
            label = %trace.classification.label,
            rounds = trace.rounds,
            tool_calls = trace.entries().len(),
            errors = trace.error_count(),
            partial = trace.is_partial(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn complete"
        );

        let investigation = match &self.store {
            Some(store) => {
                let record = InvestigationRecord::new(
                    session.id(),
                    query,
                    trace.clone(),
                    session.conversation().await.messages().to_vec(),
                );
                Some(audit::submit(Arc::clone(store), record))
            }
            None => None,
        };

        Ok(TurnOutcome {
            turn_id,
            trace,
            investigation,
        })
    }
}

/// Metrics label for turns that failed before classification.
const UNROUTED: &str = "unrouted";

/// Race `fut` against cancellation of the turn.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
        result = fut => result,
    }
}

fn catalog_down(e: OrchestrationError) -> OrchestrationError {
    match e {
        OrchestrationError::ToolCatalogUnreachable(_) | OrchestrationError::Cancelled => e,
        other => OrchestrationError::ToolCatalogUnreachable(other.to_string()),
    }
}

fn discovery_timed_out(step: &str) -> OrchestrationError {
    warn!(step, "Tool catalog did not answer within the turn budget");
    OrchestrationError::ToolCatalogUnreachable(format!("{} did not finish within the turn budget", step))
}

fn classification_timed_out() -> crate::models::Classification {
    warn!("Classification ran past the turn budget");
    crate::models::Classification::unclassified("Classification did not finish within the turn budget")
}

fn label_partial(answer: String, completion: Completion, config: &OrchestratorConfig) -> String {
    let reason = match completion {
        Completion::Planner => return answer,
        Completion::RoundLimit => format!(
            "the investigation stopped after the maximum of {} planning rounds",
            config.max_rounds
        ),
        Completion::TimeBudget => format!(
            "the investigation ran out of its {}s time budget",
            config.turn_budget.as_secs()
        ),
    };
    format!(
        "> **Partial answer:** {}, so these findings may be incomplete.\n\n{}",
        reason, answer
    )
}
