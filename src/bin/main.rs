//! Command-line turn runner.
//!
//! `spectra "<question>"` runs one turn against the configured MCP server
//! and LLM provider. `spectra --demo "<question>"` runs offline against
//! recorded alert and vulnerability fixtures with a scripted planner.

use serde_json::json;
use spectra_orchestrator::{
    agent::Orchestrator,
    config::{AppConfig, OrchestratorConfig},
    models::{empty_object_schema, ProposedCall, ToolDescriptor},
    planner::ScriptedPlanner,
    session::ConversationSession,
    synthesis::EvidenceSynthesizer,
    tools::{FixtureTool, ToolRegistry},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_QUERY: &str =
    "Which endpoints have both active critical alerts AND unpatched critical vulnerabilities?";

fn demo_orchestrator() -> Orchestrator {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FixtureTool::new(
        ToolDescriptor::new("list_alerts", "List security alerts", empty_object_schema()),
        json!({ "data": [
            { "id": "alert-1", "severity": "CRITICAL", "status": "NEW", "endpoint": "web-01" },
            { "id": "alert-2", "severity": "CRITICAL", "status": "NEW", "endpoint": "hr-laptop-7" },
            { "id": "alert-3", "severity": "CRITICAL", "status": "IN_PROGRESS", "endpoint": "db-02" }
        ]}),
    )));
    registry.register(Arc::new(FixtureTool::new(
        ToolDescriptor::new("list_vulnerabilities", "List vulnerabilities", empty_object_schema()),
        json!({ "data": [
            { "cve": "CVE-2024-3400", "severity": "CRITICAL", "status": "OPEN", "endpoint": "web-01" },
            { "cve": "CVE-2023-4966", "severity": "CRITICAL", "status": "OPEN", "endpoint": "db-02" },
            { "cve": "CVE-2024-21762", "severity": "CRITICAL", "status": "OPEN", "endpoint": "build-04" }
        ]}),
    )));

    let planner = ScriptedPlanner::from_rounds(vec![vec![
        ProposedCall::new("list_alerts", json!({ "severity": "CRITICAL", "status": "NEW" })),
        ProposedCall::new("list_vulnerabilities", json!({ "severity": "CRITICAL", "status": "OPEN" })),
    ]]);

    Orchestrator::new(
        Arc::new(registry),
        Arc::new(planner),
        Arc::new(EvidenceSynthesizer),
        OrchestratorConfig::default(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let demo = match args.iter().position(|a| a == "--demo") {
        Some(pos) => {
            args.remove(pos);
            true
        }
        None => false,
    };
    let query = if args.is_empty() {
        DEFAULT_QUERY.to_string()
    } else {
        args.join(" ")
    };

    let orchestrator = if demo {
        info!("Running offline demo");
        demo_orchestrator()
    } else {
        Orchestrator::from_config(&AppConfig::from_env()?)?
    };

    let session = ConversationSession::new("cli");
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the turn.
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match orchestrator.run_turn(&session, &query, &cancel).await {
        Ok(outcome) => {
            println!("\n=== ANSWER ===\n");
            println!("{}", outcome.trace.answer.as_deref().unwrap_or_default());
            println!("\n=== THOUGHT PROCESS ===\n");
            println!("{}", serde_json::to_string_pretty(&outcome.response())?);

            if let Some(handle) = outcome.investigation {
                match handle.await? {
                    Ok(id) => println!("\nInvestigation stored: {}", id),
                    Err(e) => eprintln!("\nInvestigation not stored: {}", e),
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Turn failed: {}", e.user_message());
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
