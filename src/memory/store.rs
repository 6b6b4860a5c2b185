//! Conversation storage
//!
//! Ordered, append-only message history for one session.

use crate::models::{Message, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Rough token estimate used by the context window.
pub fn estimate_tokens(content: &str) -> usize {
    (content.len() + 3) / 4
}

/// Conversation history for a session. Messages are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    /// Total token count (approximate)
    total_tokens: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            updated_at: Utc::now(),
            messages: Vec::new(),
            total_tokens: 0,
        }
    }

    /// Seed a conversation from caller-supplied history.
    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut conversation = Self::new();
        for message in messages {
            conversation.push(message);
        }
        conversation
    }

    pub fn push(&mut self, message: Message) {
        self.total_tokens += estimate_tokens(&message.content);
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Immutable copy for a turn to read from.
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::from(self.messages.as_slice())
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Render messages as plain text for single-shot prompts.
pub fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        let role = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(&format!("{}: {}\n\n", role, msg.content));
    }

    out
}
