//! Context Window Management
//!
//! Decides how much of a conversation snapshot the planner gets to see.
//! No limit is applied unless the caller configures one.

use crate::config::OrchestratorConfig;
use crate::memory::store::estimate_tokens;
use crate::models::Message;
use tracing::debug;

/// Configuration for context window management
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Keep at most this many of the most recent messages.
    pub max_messages: Option<usize>,
    /// Keep the most recent messages whose estimated tokens fit in this budget.
    pub max_tokens: Option<usize>,
}

impl From<&OrchestratorConfig> for ContextConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_messages: config.history_window,
            max_tokens: None,
        }
    }
}

/// Windows conversation snapshots for LLM context.
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Newest-first selection, returned in original order.
    pub fn window<'a>(&self, messages: &'a [Message]) -> &'a [Message] {
        let mut start = match self.config.max_messages {
            Some(max) if messages.len() > max => messages.len() - max,
            _ => 0,
        };

        if let Some(budget) = self.config.max_tokens {
            let mut used = 0usize;
            let mut token_start = messages.len();
            for (i, msg) in messages.iter().enumerate().rev() {
                used += estimate_tokens(&msg.content);
                if used > budget {
                    break;
                }
                token_start = i;
            }
            start = start.max(token_start);
        }

        if start > 0 {
            debug!(
                dropped = start,
                kept = messages.len() - start,
                "Windowed conversation history"
            );
        }

        &messages[start..]
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}
