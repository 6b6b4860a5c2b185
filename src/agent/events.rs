//! Turn progress events
//!
//! Pushed while a turn runs so a client can render progress before the
//! answer is ready. The API forwards them as server-sent events.

use crate::models::TurnResponse;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TurnEvent {
    OrchestratorStart {
        status: &'static str,
    },
    AgentStart {
        agent: String,
        status: &'static str,
    },
    ToolCall {
        agent: String,
        tool: String,
        call_index: u32,
        round: u32,
        status: &'static str,
    },
    ToolResult {
        agent: String,
        tool: String,
        call_index: u32,
        status: &'static str,
        elapsed_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        duplicate_of: Option<u32>,
    },
    AgentComplete {
        agent: String,
        status: &'static str,
    },
    Result {
        status: &'static str,
        result: String,
        response: Box<TurnResponse>,
    },
    Error {
        status: &'static str,
        message: String,
    },
}

impl TurnEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::OrchestratorStart { .. } => "orchestrator_start",
            TurnEvent::AgentStart { .. } => "agent_start",
            TurnEvent::ToolCall { .. } => "tool_call",
            TurnEvent::ToolResult { .. } => "tool_result",
            TurnEvent::AgentComplete { .. } => "agent_complete",
            TurnEvent::Result { .. } => "result",
            TurnEvent::Error { .. } => "error",
        }
    }

    /// `result` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Result { .. } | TurnEvent::Error { .. })
    }
}

/// Optional receiver of turn events. Sends never block and never fail the turn.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl EventSink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(event);
        }
    }
}
