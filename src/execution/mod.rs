//! Execution engine for one planning round
//!
//! Turns proposals into indexed calls, rejects the malformed ones, answers
//! repeats from earlier results, and runs the rest concurrently under a
//! per-call timeout. No LLM is involved here.

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::metrics::MetricsCollector;
use crate::models::{
    ProposedCall, ToolCall, ToolDescriptor, ToolErrorKind, ToolFailure, ToolOutcome, ToolResult,
    TraceEntry,
};
use crate::tools::ToolCatalog;
use crate::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type DedupKey = (String, String);

/// Outcomes of every call actually dispatched during a turn.
#[derive(Debug, Default)]
pub struct DedupCache {
    seen: HashMap<DedupKey, (u32, ToolOutcome)>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

enum Disposition {
    Reject(ToolFailure),
    /// Copy of an earlier call. `outcome` is known when it came from a
    /// previous round.
    Copy {
        original: u32,
        outcome: Option<ToolOutcome>,
    },
    Dispatch,
}

/// Executes the calls of one planning round against the catalog.
pub struct RoundExecutor {
    catalog: Arc<dyn ToolCatalog>,
    tool_timeout: Duration,
    max_calls_per_round: usize,
    metrics: Arc<MetricsCollector>,
}

impl RoundExecutor {
    pub fn new(
        catalog: Arc<dyn ToolCatalog>,
        config: &OrchestratorConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            catalog,
            tool_timeout: config.tool_timeout,
            max_calls_per_round: config.max_calls_per_round,
            metrics,
        }
    }

    /// Run one round. Returns one entry per proposal, in proposal order,
    /// with indices starting at `first_index`.
    ///
    /// Calls are spawned, so if the caller is dropped the in-flight ones
    /// still finish and their results are discarded. An `unreachable`
    /// result is fatal for the turn.
    pub async fn execute_round(
        &self,
        round: u32,
        first_index: u32,
        proposals: Vec<ProposedCall>,
        tools: &[ToolDescriptor],
        cache: &mut DedupCache,
    ) -> Result<Vec<TraceEntry>> {
        let mut calls = Vec::with_capacity(proposals.len());
        let mut dispositions = Vec::with_capacity(proposals.len());
        let mut in_round: HashMap<DedupKey, u32> = HashMap::new();

        for (offset, proposal) in proposals.into_iter().enumerate() {
            let call = ToolCall {
                index: first_index + offset as u32,
                round,
                tool: proposal.tool,
                arguments: proposal.arguments,
            };

            let disposition = if offset >= self.max_calls_per_round {
                Disposition::Reject(ToolFailure::new(
                    ToolErrorKind::InvalidArgument,
                    format!(
                        "round exceeds the limit of {} calls; not executed",
                        self.max_calls_per_round
                    ),
                ))
            } else if let Err(failure) = validate(&call, tools) {
                Disposition::Reject(failure)
            } else {
                let key = call.dedup_key();
                if let Some((original, outcome)) = cache.seen.get(&key) {
                    Disposition::Copy {
                        original: *original,
                        outcome: Some(outcome.clone()),
                    }
                } else if let Some(original) = in_round.get(&key) {
                    Disposition::Copy {
                        original: *original,
                        outcome: None,
                    }
                } else {
                    in_round.insert(key, call.index);
                    Disposition::Dispatch
                }
            };

            calls.push(call);
            dispositions.push(disposition);
        }

        let dispatched: Vec<&ToolCall> = calls
            .iter()
            .zip(&dispositions)
            .filter(|(_, d)| matches!(d, Disposition::Dispatch))
            .map(|(c, _)| c)
            .collect();

        debug!(
            round,
            proposed = calls.len(),
            dispatched = dispatched.len(),
            "Executing round"
        );

        let handles = dispatched.iter().map(|call| {
            let catalog = Arc::clone(&self.catalog);
            let tool = call.tool.clone();
            let arguments = call.arguments.clone();
            let limit = self.tool_timeout;
            tokio::spawn(async move {
                let start = Instant::now();
                let outcome = match tokio::time::timeout(limit, catalog.call_tool(&tool, &arguments)).await {
                    Ok(Ok(payload)) => ToolOutcome::Ok { payload },
                    Ok(Err(error)) => ToolOutcome::Error { error },
                    Err(_) => ToolOutcome::Error {
                        error: ToolFailure::new(
                            ToolErrorKind::Timeout,
                            format!("no result within {}s", limit.as_secs_f64()),
                        ),
                    },
                };
                (outcome, start.elapsed().as_millis() as u64)
            })
        });

        let mut finished: HashMap<u32, (ToolOutcome, u64)> = HashMap::new();
        for (call, joined) in dispatched.iter().zip(join_all(handles).await) {
            let (outcome, elapsed_ms) = joined.unwrap_or_else(|e| {
                (
                    ToolOutcome::Error {
                        error: ToolFailure::new(
                            ToolErrorKind::Transport,
                            format!("tool task failed: {}", e),
                        ),
                    },
                    0,
                )
            });
            match &outcome {
                ToolOutcome::Ok { .. } => debug!(
                    round,
                    call_index = call.index,
                    tool = %call.tool,
                    elapsed_ms,
                    "Tool call succeeded"
                ),
                ToolOutcome::Error { error } => warn!(
                    round,
                    call_index = call.index,
                    tool = %call.tool,
                    elapsed_ms,
                    kind = %error.kind,
                    "Tool call failed"
                ),
            }
            self.metrics
                .record_tool_call(&call.tool, elapsed_ms, !outcome.is_ok());
            finished.insert(call.index, (outcome, elapsed_ms));
        }

        if let Some((index, failure)) = finished.iter().find_map(|(index, (outcome, _))| match outcome {
            ToolOutcome::Error { error } if error.kind == ToolErrorKind::Unreachable => {
                Some((*index, error))
            }
            _ => None,
        }) {
            error!(round, call_index = index, detail = %failure.detail, "Tool catalog unreachable");
            return Err(OrchestrationError::ToolCatalogUnreachable(failure.detail.clone()));
        }

        let mut entries = Vec::with_capacity(calls.len());
        for (call, disposition) in calls.into_iter().zip(dispositions) {
            let result = match disposition {
                Disposition::Reject(error) => {
                    warn!(round, call_index = call.index, tool = %call.tool, kind = %error.kind, "Call rejected");
                    ToolResult {
                        call_index: call.index,
                        outcome: ToolOutcome::Error { error },
                        elapsed_ms: 0,
                        duplicate_of: None,
                    }
                }
                Disposition::Copy { original, outcome } => {
                    debug!(round, call_index = call.index, original, "Duplicate call answered from earlier result");
                    let outcome = match outcome {
                        Some(outcome) => outcome,
                        None => finished
                            .get(&original)
                            .map(|(o, _)| o.clone())
                            .ok_or_else(|| {
                                OrchestrationError::PlanningError(format!(
                                    "missing result for call {}",
                                    original
                                ))
                            })?,
                    };
                    ToolResult {
                        call_index: call.index,
                        outcome,
                        elapsed_ms: 0,
                        duplicate_of: Some(original),
                    }
                }
                Disposition::Dispatch => {
                    let (outcome, elapsed_ms) = finished.get(&call.index).cloned().ok_or_else(|| {
                        OrchestrationError::PlanningError(format!(
                            "missing result for call {}",
                            call.index
                        ))
                    })?;
                    cache
                        .seen
                        .insert(call.dedup_key(), (call.index, outcome.clone()));
                    ToolResult {
                        call_index: call.index,
                        outcome,
                        elapsed_ms,
                        duplicate_of: None,
                    }
                }
            };
            entries.push(TraceEntry { call, result });
        }

        Ok(entries)
    }
}

/// Reject unknown tools, non-object arguments and missing required fields.
fn validate(call: &ToolCall, tools: &[ToolDescriptor]) -> std::result::Result<(), ToolFailure> {
    let Some(descriptor) = tools.iter().find(|t| t.name == call.tool) else {
        return Err(ToolFailure::new(
            ToolErrorKind::UnknownTool,
            format!("'{}' is not in the tool catalog", call.tool),
        ));
    };

    let Some(arguments) = call.arguments.as_object() else {
        return Err(ToolFailure::new(
            ToolErrorKind::InvalidArgument,
            format!("arguments must be a JSON object, got {}", call.arguments),
        ));
    };

    let missing: Vec<&str> = descriptor
        .required_arguments()
        .into_iter()
        .filter(|name| !arguments.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(ToolFailure::new(
            ToolErrorKind::InvalidArgument,
            format!("missing required argument(s): {}", missing.join(", ")),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::empty_object_schema;
    use crate::tools::ToolCallResult;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        calls: AtomicUsize,
        delay: Duration,
        failure: Option<ToolErrorKind>,
    }

    impl CountingCatalog {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                failure: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl ToolCatalog for CountingCatalog {
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            Ok(descriptors())
        }

        async fn call_tool(&self, name: &str, arguments: &Value) -> ToolCallResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.failure {
                Some(kind) => Err(ToolFailure::new(kind, "stub failure")),
                None => Ok(json!({ "tool": name, "args": arguments })),
            }
        }
    }

    fn descriptors() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("list_alerts", "List alerts", empty_object_schema()),
            ToolDescriptor::new(
                "get_alert",
                "Get one alert",
                json!({ "type": "object", "properties": { "alert_id": { "type": "string" } }, "required": ["alert_id"] }),
            ),
        ]
    }

    fn executor(catalog: Arc<CountingCatalog>, config: OrchestratorConfig) -> RoundExecutor {
        RoundExecutor::new(catalog, &config, Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn test_only_real_invocations_are_measured() {
        let catalog = Arc::new(CountingCatalog::new());
        let metrics = Arc::new(MetricsCollector::new());
        let exec = RoundExecutor::new(catalog, &OrchestratorConfig::default(), metrics.clone());
        let mut cache = DedupCache::new();

        exec.execute_round(
            1,
            1,
            vec![
                ProposedCall::new("list_alerts", json!({})),
                ProposedCall::new("list_alerts", json!({})),
                ProposedCall::new("get_alert", json!({})),
            ],
            &descriptors(),
            &mut cache,
        )
        .await
        .unwrap();

        let tools = metrics.snapshot().tools;
        assert_eq!(tools["list_alerts"].call_count, 1);
        assert!(!tools.contains_key("get_alert"));
    }

    #[tokio::test]
    async fn test_invalid_calls_become_error_results() {
        let catalog = Arc::new(CountingCatalog::new());
        let exec = executor(catalog.clone(), OrchestratorConfig::default());
        let mut cache = DedupCache::new();

        let entries = exec
            .execute_round(
                1,
                1,
                vec![
                    ProposedCall::new("drop_tables", json!({})),
                    ProposedCall::new("get_alert", json!({})),
                    ProposedCall::new("list_alerts", json!("{oops")),
                    ProposedCall::new("get_alert", json!({ "alert_id": "a-1" })),
                ],
                &descriptors(),
                &mut cache,
            )
            .await
            .unwrap();

        let kinds: Vec<Option<ToolErrorKind>> = entries
            .iter()
            .map(|e| match &e.result.outcome {
                ToolOutcome::Error { error } => Some(error.kind),
                ToolOutcome::Ok { .. } => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                Some(ToolErrorKind::UnknownTool),
                Some(ToolErrorKind::InvalidArgument),
                Some(ToolErrorKind::InvalidArgument),
                None,
            ]
        );
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
        let indices: Vec<u32> = entries.iter().map(|e| e.call.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_duplicates_within_and_across_rounds() {
        let catalog = Arc::new(CountingCatalog::new());
        let exec = executor(catalog.clone(), OrchestratorConfig::default());
        let mut cache = DedupCache::new();
        let tools = descriptors();

        let first = exec
            .execute_round(
                1,
                1,
                vec![
                    ProposedCall::new("list_alerts", json!({ "severity": "HIGH", "limit": 5 })),
                    ProposedCall::new("list_alerts", json!({ "limit": 5, "severity": "HIGH" })),
                ],
                &tools,
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(first[1].result.duplicate_of, Some(1));
        assert_eq!(first[1].result.outcome, first[0].result.outcome);

        let second = exec
            .execute_round(
                2,
                3,
                vec![ProposedCall::new("list_alerts", json!({ "severity": "HIGH", "limit": 5 }))],
                &tools,
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(second[0].call.index, 3);
        assert_eq!(second[0].result.duplicate_of, Some(1));
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_round_cap() {
        let catalog = Arc::new(CountingCatalog::new());
        let config = OrchestratorConfig {
            max_calls_per_round: 1,
            ..OrchestratorConfig::default()
        };
        let exec = executor(catalog.clone(), config);
        let mut cache = DedupCache::new();

        let entries = exec
            .execute_round(
                1,
                1,
                vec![
                    ProposedCall::new("list_alerts", json!({})),
                    ProposedCall::new("get_alert", json!({ "alert_id": "x" })),
                ],
                &descriptors(),
                &mut cache,
            )
            .await
            .unwrap();

        assert!(entries[0].result.outcome.is_ok());
        assert!(!entries[1].result.outcome.is_ok());
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_an_error_result() {
        let catalog = Arc::new(CountingCatalog {
            delay: Duration::from_millis(200),
            ..CountingCatalog::new()
        });
        let config = OrchestratorConfig {
            tool_timeout: Duration::from_millis(20),
            ..OrchestratorConfig::default()
        };
        let exec = executor(catalog, config);
        let mut cache = DedupCache::new();

        let entries = exec
            .execute_round(1, 1, vec![ProposedCall::new("list_alerts", json!({}))], &descriptors(), &mut cache)
            .await
            .unwrap();

        match &entries[0].result.outcome {
            ToolOutcome::Error { error } => assert_eq!(error.kind, ToolErrorKind::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_is_fatal() {
        let catalog = Arc::new(CountingCatalog {
            failure: Some(ToolErrorKind::Unreachable),
            ..CountingCatalog::new()
        });
        let exec = executor(catalog, OrchestratorConfig::default());
        let mut cache = DedupCache::new();

        let err = exec
            .execute_round(1, 1, vec![ProposedCall::new("list_alerts", json!({}))], &descriptors(), &mut cache)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
