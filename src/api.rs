//! REST API server for the investigation orchestrator
//!
//! Exposes turn invocation, catalog and agent listings, and stored
//! investigations over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::{header::ACCEPT, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{EventSink, Orchestrator};
use crate::classifier::{AGENT_PROFILES, GENERAL};
use crate::error::OrchestrationError;
use crate::models::{HistoryMessage, Message, TurnRequest, TurnResponse};
use crate::session::{ConversationSession, SessionRegistry};

const DEFAULT_LIST_LIMIT: usize = 50;

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<SessionRegistry>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }
}

fn to_messages(history: Vec<HistoryMessage>) -> Vec<Message> {
    history
        .into_iter()
        .map(|m| Message {
            role: m.role,
            content: m.content,
            timestamp: chrono::Utc::now(),
        })
        .collect()
}

fn error_status(e: &OrchestrationError) -> StatusCode {
    match e {
        _ if e.is_fatal() => StatusCode::SERVICE_UNAVAILABLE,
        OrchestrationError::SessionClosed(_) => StatusCode::CONFLICT,
        OrchestrationError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoints
/// =============================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn mcp_health(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    match state.orchestrator.catalog().health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "connected" }))),
        Err(e) => {
            warn!(error = %e, "Tool catalog health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "disconnected", "detail": e.user_message() })),
            )
        }
    }
}

/// =============================
/// Catalog & Agents
/// =============================

async fn list_tools(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    match state.orchestrator.catalog().list_tools().await {
        Ok(tools) => (
            StatusCode::OK,
            Json(json!({ "count": tools.len(), "tools": tools })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "detail": e.user_message() })),
        ),
    }
}

async fn list_agents() -> Json<Value> {
    let mut agents: Vec<Value> = AGENT_PROFILES
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "description": p.description,
                "tools": p.preferred_tools,
            })
        })
        .collect();
    agents.push(json!({
        "name": GENERAL,
        "description": "Handles queries that don't clearly match any specialist, with every tool available.",
        "tools": [],
    }));
    Json(json!({ "agents": agents }))
}

/// =============================
/// Turn Endpoint
/// =============================

fn wants_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

async fn run_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<TurnRequest>,
) -> Response {
    let query = req.query.trim().to_string();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(TurnResponse::error("Query must not be empty.")),
        )
            .into_response();
    }

    let history = to_messages(req.conversation_history);
    let session: Arc<ConversationSession> = match req.session_id.as_deref() {
        Some(id) if !id.trim().is_empty() => state.sessions.get_or_create(id, history).await,
        _ => Arc::new(ConversationSession::transient(history)),
    };
    info!(session_id = %session.id(), "Received query");

    // The turn runs in its own task; if the handler or the event stream is
    // dropped (client gone) the guard cancels the turn so nothing is
    // appended or persisted.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let orchestrator = Arc::clone(&state.orchestrator);

    if wants_streaming(&headers) {
        let (sink, rx) = EventSink::channel();
        tokio::spawn(async move {
            let _ = orchestrator
                .run_turn_with_events(&session, &query, &cancel, &sink)
                .await;
        });

        let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let event = rx.recv().await?;
            let sse = Event::default().event(event.name()).json_data(&event);
            Some((sse, (rx, guard)))
        });
        return Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    let turn = tokio::spawn(async move {
        orchestrator.run_turn(&session, &query, &cancel).await
    });

    let response = match turn.await {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(outcome.response())),
        Ok(Err(e)) => (error_status(&e), Json(TurnResponse::error(e.user_message()))),
        Err(e) => {
            warn!(error = %e, "Turn task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TurnResponse::error("The investigation could not be completed.")),
            )
        }
    };
    drop(guard);
    response.into_response()
}

/// =============================
/// Metrics
/// =============================

async fn get_metrics(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "metrics": state.orchestrator.metrics().snapshot(),
    }))
}

async fn reset_metrics(State(state): State<ApiState>) -> Json<Value> {
    state.orchestrator.metrics().reset();
    Json(json!({ "status": "success" }))
}

/// =============================
/// Investigations
/// =============================

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

async fn list_investigations(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> (StatusCode, Json<Value>) {
    let Some(store) = state.orchestrator.store() else {
        return (StatusCode::OK, Json(json!({ "investigations": [] })));
    };

    match store.list(params.limit.unwrap_or(DEFAULT_LIST_LIMIT)).await {
        Ok(items) => (StatusCode::OK, Json(json!({ "investigations": items }))),
        Err(e) => {
            warn!(error = %e, "Listing investigations failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "detail": e.user_message() })),
            )
        }
    }
}

async fn get_investigation(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    let not_found = || {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "detail": "Investigation not found." })),
        )
    };

    let Some(store) = state.orchestrator.store() else {
        return not_found();
    };

    match store.get(id).await {
        Ok(Some(record)) => {
            let verified = record.verify_integrity();
            let mut body = serde_json::to_value(&record).unwrap_or_else(|_| json!({}));
            body["integrity_verified"] = json!(verified);
            (StatusCode::OK, Json(body))
        }
        Ok(None) => not_found(),
        Err(e) => {
            warn!(error = %e, "Loading investigation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "detail": e.user_message() })),
            )
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/mcp-health", get(mcp_health))
        .route("/api/tools", get(list_tools))
        .route("/api/agents", get(list_agents))
        .route("/api/query", post(run_query))
        .route("/api/investigations", get(list_investigations))
        .route("/api/investigations/:id", get(get_investigation))
        .route("/api/metrics", get(get_metrics))
        .route("/api/metrics/reset", post(reset_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
