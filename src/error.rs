//! Error types for the security investigation orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Fatal-per-turn
    // =============================

    #[error("Tool catalog unreachable: {0}")]
    ToolCatalogUnreachable(String),

    #[error("Planner unavailable: {0}")]
    PlannerUnavailable(String),

    // =============================
    // Session / turn lifecycle
    // =============================

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Turn cancelled")]
    Cancelled,

    // =============================
    // Local failures
    // =============================

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Conditions after which no further progress in the turn is meaningful.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ToolCatalogUnreachable(_)
                | OrchestrationError::PlannerUnavailable(_)
        )
    }

    /// Message safe to show an analyst: no upstream bodies, URLs or keys.
    pub fn user_message(&self) -> String {
        match self {
            OrchestrationError::ToolCatalogUnreachable(_) => {
                "The security data tool server is unreachable. Check the MCP server connection and try again.".to_string()
            }
            OrchestrationError::PlannerUnavailable(_) => {
                "The reasoning engine is unavailable. Check the LLM provider settings and try again.".to_string()
            }
            OrchestrationError::SessionClosed(_) => {
                "This conversation has been closed. Start a new conversation.".to_string()
            }
            OrchestrationError::Cancelled => "The request was cancelled.".to_string(),
            OrchestrationError::ConfigError(_) => "The orchestrator is misconfigured.".to_string(),
            _ => "The investigation could not be completed.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(OrchestrationError::ToolCatalogUnreachable("down".into()).is_fatal());
        assert!(OrchestrationError::PlannerUnavailable("down".into()).is_fatal());
        assert!(!OrchestrationError::PlanningError("boom".into()).is_fatal());
        assert!(!OrchestrationError::Cancelled.is_fatal());
    }

    #[test]
    fn test_user_message_does_not_leak_detail() {
        let err = OrchestrationError::PlannerUnavailable(
            "POST https://api.example.com?key=sk-secret failed".into(),
        );
        let message = err.user_message();
        assert!(!message.contains("sk-secret"));
        assert!(!message.contains("https://"));
    }
}
