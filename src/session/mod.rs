//! Session state
//!
//! A session owns one conversation. Appends and snapshots are atomic with
//! respect to each other, and turns on the same session are serialized.

use crate::error::OrchestrationError;
use crate::memory::Conversation;
use crate::models::Message;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Sessions idle longer than this are dropped by `evict_idle`.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

struct SessionState {
    conversation: Conversation,
    closed: bool,
    last_active: Instant,
}

pub struct ConversationSession {
    id: String,
    state: RwLock<SessionState>,
    turn_lock: Arc<Mutex<()>>,
}

/// Held for the duration of one turn.
pub struct TurnGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_conversation(id, Conversation::new())
    }

    pub fn with_conversation(id: impl Into<String>, conversation: Conversation) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(SessionState {
                conversation,
                closed: false,
                last_active: Instant::now(),
            }),
            turn_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Session with a random id, seeded from caller history.
    pub fn transient(history: impl IntoIterator<Item = Message>) -> Self {
        Self::with_conversation(
            format!("transient-{}", Uuid::new_v4()),
            Conversation::from_messages(history),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn append(&self, message: Message) -> Result<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(OrchestrationError::SessionClosed(self.id.clone()));
        }
        state.conversation.push(message);
        state.last_active = Instant::now();
        Ok(())
    }

    pub async fn snapshot(&self) -> Arc<[Message]> {
        self.state.read().await.conversation.snapshot()
    }

    /// Full copy of the conversation, for persistence.
    pub async fn conversation(&self) -> Conversation {
        self.state.read().await.conversation.clone()
    }

    pub async fn close(&self) {
        self.state.write().await.closed = true;
        debug!(session_id = %self.id, "Session closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    async fn idle_for(&self) -> Duration {
        self.state.read().await.last_active.elapsed()
    }

    /// Wait for any running turn on this session to finish.
    pub async fn begin_turn(&self) -> Result<TurnGuard> {
        let guard = self.turn_lock.clone().lock_owned().await;
        if self.is_closed().await {
            return Err(OrchestrationError::SessionClosed(self.id.clone()));
        }
        Ok(TurnGuard { _guard: guard })
    }
}

/// Registry of live sessions keyed by caller-chosen id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ConversationSession>>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ConversationSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Look up a session, creating it from `history` when it does not exist yet.
    pub async fn get_or_create(
        &self,
        id: &str,
        history: impl IntoIterator<Item = Message>,
    ) -> Arc<ConversationSession> {
        if let Some(existing) = self.get(id).await {
            return existing;
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(session_id = %id, "Creating session");
                Arc::new(ConversationSession::with_conversation(
                    id,
                    Conversation::from_messages(history),
                ))
            })
            .clone()
    }

    pub async fn close(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Drop sessions idle longer than the TTL. Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        let snapshot: Vec<(String, Arc<ConversationSession>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, session) in snapshot {
            if session.idle_for().await > self.ttl {
                expired.push(id);
            }
        }

        let mut sessions = self.sessions.write().await;
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "Evicted idle sessions");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_fails_after_close() {
        let session = ConversationSession::new("s1");
        session.append(Message::user("hello")).await.unwrap();
        session.close().await;

        let err = session.append(Message::user("again")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::SessionClosed(_)));
        assert_eq!(session.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_turns_are_serialized() {
        let session = ConversationSession::new("s1");
        let guard = session.begin_turn().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(20), session.begin_turn()).await;
        assert!(waiting.is_err());

        drop(guard);
        assert!(session.begin_turn().await.is_ok());
    }

    #[tokio::test]
    async fn test_registry_reuses_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("inv-1", vec![Message::user("q")]).await;
        let b = registry.get_or_create("inv-1", Vec::new()).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let registry = SessionRegistry::with_ttl(Duration::from_millis(0));
        registry.get_or_create("inv-1", Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registry_close() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("inv-1", Vec::new()).await;
        assert!(registry.close("inv-1").await);
        assert!(session.is_closed().await);
        assert!(registry.get("inv-1").await.is_none());
    }
}
