mod common;

use common::{security_catalog, Behavior, StubCatalog};
use serde_json::json;
use spectra_orchestrator::audit::{InMemoryInvestigationStore, InvestigationStore};
use spectra_orchestrator::config::OrchestratorConfig;
use spectra_orchestrator::error::OrchestrationError;
use spectra_orchestrator::models::{
    canonical_json, Classification, Completion, ProposedCall, Role, ToolErrorKind, ToolOutcome,
};
use spectra_orchestrator::planner::{PlanDecision, ScriptedPlanner};
use spectra_orchestrator::synthesis::EvidenceSynthesizer;
use spectra_orchestrator::{ConversationSession, Orchestrator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const CORRELATION_QUERY: &str =
    "Which endpoints have both active critical alerts AND unpatched critical vulnerabilities?";

fn build(catalog: Arc<StubCatalog>, planner: ScriptedPlanner, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(catalog, Arc::new(planner), Arc::new(EvidenceSynthesizer), config)
}

fn correlation_planner() -> ScriptedPlanner {
    ScriptedPlanner::from_rounds(vec![vec![
        ProposedCall::new("list_alerts", json!({ "severity": "CRITICAL", "status": "NEW" })),
        ProposedCall::new("list_vulnerabilities", json!({ "severity": "CRITICAL", "status": "OPEN" })),
    ]])
    .with_classification(Classification::new("correlation", "alerts and vulnerabilities"))
}

#[tokio::test]
async fn test_zero_call_turn_still_answers() {
    let catalog = Arc::new(security_catalog());
    let orch = build(catalog.clone(), ScriptedPlanner::conversational(), OrchestratorConfig::default());
    let session = ConversationSession::new("s");

    let outcome = orch
        .run_turn(&session, "thanks, that's all", &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.trace.entries().is_empty());
    assert!(!outcome.trace.answer.as_deref().unwrap().trim().is_empty());
    assert_eq!(outcome.trace.completion, Some(Completion::Planner));
    assert!(outcome.response().tools_used.is_empty());
    assert_eq!(catalog.total_calls(), 0);
}

#[tokio::test]
async fn test_indices_contiguous_with_one_result_each() {
    let catalog = Arc::new(security_catalog());
    let planner = ScriptedPlanner::from_rounds(vec![
        vec![
            ProposedCall::new("list_alerts", json!({ "limit": 1 })),
            ProposedCall::new("list_vulnerabilities", json!({ "limit": 1 })),
        ],
        vec![
            ProposedCall::new("no_such_tool", json!({})),
            ProposedCall::new("list_alerts", json!({ "limit": 2 })),
        ],
    ]);
    let orch = build(catalog, planner, OrchestratorConfig::default());

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), "q", &CancellationToken::new())
        .await
        .unwrap();

    let entries = outcome.trace.entries();
    assert_eq!(entries.len(), 4);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.call.index, i as u32 + 1);
        assert_eq!(entry.result.call_index, entry.call.index);
    }
    assert_eq!(entries[2].call.round, 2);
    match &entries[2].result.outcome {
        ToolOutcome::Error { error } => assert_eq!(error.kind, ToolErrorKind::UnknownTool),
        other => panic!("expected unknown tool error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_round_ceiling_forces_partial_answer() {
    let catalog = Arc::new(security_catalog());
    let config = OrchestratorConfig {
        max_rounds: 4,
        ..OrchestratorConfig::default()
    };
    let orch = build(catalog.clone(), ScriptedPlanner::endless("list_alerts"), config);

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), "dig forever", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.trace.rounds, 4);
    assert_eq!(outcome.trace.completion, Some(Completion::RoundLimit));
    assert_eq!(catalog.calls("list_alerts"), 4);
    let response = outcome.response();
    assert_eq!(response.partial, Some(true));
    assert!(response.result.unwrap().contains("Partial answer"));
}

#[tokio::test]
async fn test_turn_budget_forces_synthesis() {
    let catalog = Arc::new(
        StubCatalog::new().with_tool("list_alerts", Behavior::Slow(Duration::from_millis(300), json!([]))),
    );
    let config = OrchestratorConfig {
        turn_budget: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let planner = ScriptedPlanner::from_rounds(vec![vec![ProposedCall::new("list_alerts", json!({}))]]);
    let orch = build(catalog, planner, config);

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), "q", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.trace.completion, Some(Completion::TimeBudget));
    // The interrupted round is not recorded half-way.
    assert!(outcome.trace.entries().is_empty());
    assert!(outcome.trace.is_partial());
}

#[tokio::test]
async fn test_identical_calls_across_rounds_invoke_once() {
    let catalog = Arc::new(security_catalog());
    let planner = ScriptedPlanner::from_rounds(vec![
        vec![ProposedCall::new("list_alerts", json!({ "severity": "CRITICAL", "limit": 50 }))],
        vec![ProposedCall::new("list_alerts", json!({ "limit": 50, "severity": "CRITICAL" }))],
    ]);
    let orch = build(catalog.clone(), planner, OrchestratorConfig::default());

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), "alerts", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(catalog.calls("list_alerts"), 1);
    let entries = outcome.trace.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].result.duplicate_of, Some(1));
    assert_eq!(entries[1].result.outcome, entries[0].result.outcome);
}

#[tokio::test]
async fn test_unreachable_catalog_refuses_turn() {
    let catalog = Arc::new(security_catalog().unhealthy());
    let asked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&asked);
    let planner = ScriptedPlanner::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(PlanDecision::done())
    });
    let orch = build(catalog.clone(), planner, OrchestratorConfig::default());
    let session = ConversationSession::new("s");

    let err = assert_err!(
        orch.run_turn(&session, CORRELATION_QUERY, &CancellationToken::new())
            .await
    );

    assert!(matches!(err, OrchestrationError::ToolCatalogUnreachable(_)));
    assert!(err.is_fatal());
    assert_eq!(asked.load(Ordering::SeqCst), 0);
    assert_eq!(catalog.total_calls(), 0);
    assert!(session.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_single_tool_timeout_degrades_answer() {
    let catalog = Arc::new(
        security_catalog()
            .with_tool("list_misconfigurations", Behavior::Slow(Duration::from_secs(5), json!([]))),
    );
    let config = OrchestratorConfig {
        tool_timeout: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let planner = ScriptedPlanner::from_rounds(vec![vec![
        ProposedCall::new("list_alerts", json!({})),
        ProposedCall::new("list_misconfigurations", json!({})),
    ]]);
    let orch = build(catalog, planner, config);

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), "posture and alerts", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.trace.error_count(), 1);
    match &outcome.trace.entries()[1].result.outcome {
        ToolOutcome::Error { error } => assert_eq!(error.kind, ToolErrorKind::Timeout),
        other => panic!("expected timeout, got {:?}", other),
    }
    let answer = outcome.trace.answer.unwrap();
    assert!(answer.contains("failed (timeout)"));
    assert!(answer.contains("may be incomplete"));
}

#[tokio::test]
async fn test_per_call_unreachable_mid_turn_is_fatal() {
    let catalog = Arc::new(
        security_catalog().with_tool("purple_ai", Behavior::Fail(ToolErrorKind::Unreachable)),
    );
    let planner = ScriptedPlanner::from_rounds(vec![vec![ProposedCall::new("purple_ai", json!({ "query": "x" }))]]);
    let orch = build(catalog, planner, OrchestratorConfig::default());
    let session = ConversationSession::new("s");

    let err = orch
        .run_turn(&session, "hunt", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestrationError::ToolCatalogUnreachable(_)));
    assert!(session.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_alerts_and_vulnerabilities_correlation() {
    let catalog = Arc::new(security_catalog());
    let orch = build(catalog.clone(), correlation_planner(), OrchestratorConfig::default());

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), CORRELATION_QUERY, &CancellationToken::new())
        .await
        .unwrap();
    let response = outcome.response();

    assert_eq!(
        response.tools_used,
        vec!["list_alerts".to_string(), "list_vulnerabilities".to_string()]
    );
    assert_eq!(response.agent.as_deref(), Some("correlation"));

    let answer = response.result.unwrap();
    assert!(answer.contains("web-01"));
    assert!(answer.contains("db-02"));
    assert!(!answer.contains("hr-laptop-7"));
    assert!(!answer.contains("build-04"));

    let thought = response.thought_process.unwrap();
    assert_eq!(thought.tool_calls.len(), 2);
    assert_eq!(thought.tool_calls[0].args, json!({ "severity": "CRITICAL", "status": "NEW" }));
}

#[tokio::test]
async fn test_repeat_query_is_structurally_identical() {
    let catalog = Arc::new(security_catalog());
    let orch = build(catalog.clone(), correlation_planner(), OrchestratorConfig::default());

    let shape = |outcome: &spectra_orchestrator::TurnOutcome| {
        outcome
            .trace
            .entries()
            .iter()
            .map(|e| (e.call.index, e.call.tool.clone(), canonical_json(&e.call.arguments)))
            .collect::<Vec<_>>()
    };

    let first = orch
        .run_turn(&ConversationSession::new("a"), CORRELATION_QUERY, &CancellationToken::new())
        .await
        .unwrap();
    let second = orch
        .run_turn(&ConversationSession::new("b"), CORRELATION_QUERY, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(shape(&first), shape(&second));
    assert_eq!(first.trace.answer, second.trace.answer);
}

#[tokio::test]
async fn test_classification_failure_is_not_fatal() {
    let catalog = Arc::new(security_catalog());
    let planner = ScriptedPlanner::from_rounds(vec![vec![ProposedCall::new("list_alerts", json!({}))]])
        .without_classification();
    let orch = build(catalog, planner, OrchestratorConfig::default());

    let outcome = orch
        .run_turn(&ConversationSession::new("s"), "show critical alerts", &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.trace.classification.is_unclassified());
    assert!(outcome.trace.classification.rationale.contains("alert_triage"));
    assert_eq!(outcome.response().agent, None);
    assert_eq!(outcome.trace.entries().len(), 1);
}

#[tokio::test]
async fn test_turns_on_one_session_are_serialized() {
    let catalog = Arc::new(
        StubCatalog::new().with_tool("list_alerts", Behavior::Slow(Duration::from_millis(30), json!([]))),
    );
    let planner = ScriptedPlanner::from_rounds(vec![vec![ProposedCall::new("list_alerts", json!({}))]]);
    let orch = Arc::new(build(catalog, planner, OrchestratorConfig::default()));
    let session = Arc::new(ConversationSession::new("shared"));

    let spawn_turn = |query: &'static str| {
        let orch = Arc::clone(&orch);
        let session = Arc::clone(&session);
        tokio::spawn(async move { orch.run_turn(&session, query, &CancellationToken::new()).await })
    };
    let a = spawn_turn("first");
    let b = spawn_turn("second");
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let messages = session.snapshot().await;
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_history_is_visible_to_the_planner() {
    let catalog = Arc::new(security_catalog());
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let recorder = Arc::clone(&seen);
    let planner = ScriptedPlanner::new(move |ctx| {
        recorder.store(ctx.history.len(), Ordering::SeqCst);
        Ok(PlanDecision::done())
    });
    let config = OrchestratorConfig {
        history_window: Some(2),
        ..OrchestratorConfig::default()
    };
    let orch = build(catalog, planner, config);
    let session = ConversationSession::new("s");

    for query in ["one", "two", "three"] {
        orch.run_turn(&session, query, &CancellationToken::new())
            .await
            .unwrap();
    }

    // Four prior messages windowed down to two.
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(session.snapshot().await.len(), 6);
}

#[tokio::test]
async fn test_closed_session_rejects_turn() {
    let orch = build(
        Arc::new(security_catalog()),
        ScriptedPlanner::conversational(),
        OrchestratorConfig::default(),
    );
    let session = ConversationSession::new("s");
    session.close().await;

    let err = orch
        .run_turn(&session, "hello", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::SessionClosed(_)));
}

#[tokio::test]
async fn test_finished_turn_is_persisted() {
    let store = Arc::new(InMemoryInvestigationStore::new());
    let orch = build(Arc::new(security_catalog()), correlation_planner(), OrchestratorConfig::default())
        .with_store(store.clone());

    let outcome = assert_ok!(
        orch.run_turn(&ConversationSession::new("s"), CORRELATION_QUERY, &CancellationToken::new())
            .await
    );

    let id = outcome.investigation.unwrap().await.unwrap().unwrap();
    let record = store.get(id).await.unwrap().unwrap();
    assert!(record.verify_integrity());
    assert_eq!(record.trace.entries().len(), 2);
    assert_eq!(record.conversation.len(), 2);
    assert_eq!(record.query, CORRELATION_QUERY);
}

#[tokio::test]
async fn test_stalled_tool_discovery_is_bounded_by_turn_budget() {
    let catalog = Arc::new(security_catalog().stall_discovery(Duration::from_secs(3600)));
    let config = OrchestratorConfig {
        turn_budget: Duration::from_millis(100),
        ..OrchestratorConfig::default()
    };
    let orch = build(catalog.clone(), correlation_planner(), config);
    let session = ConversationSession::new("s");

    let finished = tokio::time::timeout(
        Duration::from_secs(3),
        orch.run_turn(&session, CORRELATION_QUERY, &CancellationToken::new()),
    )
    .await;

    let err = assert_err!(assert_ok!(finished));
    assert!(matches!(err, OrchestrationError::ToolCatalogUnreachable(_)));
    assert_eq!(catalog.total_calls(), 0);
    assert!(session.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_cancel_mid_round_discards_in_flight_results() {
    let catalog = Arc::new(
        security_catalog()
            .with_tool("list_misconfigurations", Behavior::Slow(Duration::from_millis(200), json!([]))),
    );
    let store = Arc::new(InMemoryInvestigationStore::new());
    let planner = ScriptedPlanner::from_rounds(vec![vec![ProposedCall::new("list_misconfigurations", json!({}))]]);
    let orch = Arc::new(
        build(catalog.clone(), planner, OrchestratorConfig::default()).with_store(store.clone()),
    );
    let session = Arc::new(ConversationSession::new("s"));
    let cancel = CancellationToken::new();

    let turn = {
        let orch = Arc::clone(&orch);
        let session = Arc::clone(&session);
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.run_turn(&session, "posture gaps?", &cancel).await })
    };

    // Wait until the call is in flight, then abandon the turn.
    while catalog.calls("list_misconfigurations") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let err = assert_err!(turn.await.unwrap());
    assert!(matches!(err, OrchestrationError::Cancelled));
    assert_eq!(catalog.completed(), 0);

    // The spawned call still runs to completion; its result goes nowhere.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(catalog.completed(), 1);
    assert!(session.snapshot().await.is_empty());
    assert!(store.list(10).await.unwrap().is_empty());
}
