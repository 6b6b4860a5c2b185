//! Conversation memory
//!
//! Append-only conversation history plus the windowing policy applied
//! before history is handed to the reasoning engine.

pub mod context_manager;
pub mod store;

pub use context_manager::{ContextConfig, ContextManager};
pub use store::{format_transcript, Conversation};
