//! SPECTRA Investigation Orchestrator
//!
//! Answers free-form security questions by:
//! - Classifying the question onto a specialist agent profile
//! - Planning and running bounded rounds of tool calls against a remote catalog
//! - Synthesizing an answer with an auditable thought process
//! - Handing finished investigations to persistent storage
//!
//! TURN LOOP:
//! HEALTH → CLASSIFY → PLAN → EXECUTE → PLAN … → SYNTHESIZE → DONE

pub mod agent;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod planner;
pub mod session;
pub mod synthesis;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use agent::{EventSink, Orchestrator, TurnEvent, TurnOutcome};
pub use models::*;
pub use session::{ConversationSession, SessionRegistry};
