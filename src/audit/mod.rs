//! Investigation persistence
//!
//! Finished turns are handed off here for durable storage. Storage is
//! fire-and-forget from the orchestrator's side: `submit` spawns the write
//! and the caller may await the handle if it cares about the outcome.

use crate::error::OrchestrationError;
use crate::models::{Message, Trace};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// One completed turn plus the conversation it left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationRecord {
    pub investigation_id: Uuid,
    pub session_id: String,
    pub query: String,
    pub trace: Arc<Trace>,
    pub conversation: Vec<Message>,
    /// SHA-256 of the serialized trace.
    pub trace_hash: String,
    pub created_at: DateTime<Utc>,
}

impl InvestigationRecord {
    pub fn new(
        session_id: impl Into<String>,
        query: impl Into<String>,
        trace: Trace,
        conversation: Vec<Message>,
    ) -> Self {
        let trace_hash = compute_trace_hash(&trace);
        Self {
            investigation_id: Uuid::new_v4(),
            session_id: session_id.into(),
            query: query.into(),
            trace: Arc::new(trace),
            conversation,
            trace_hash,
            created_at: Utc::now(),
        }
    }

    /// True when the stored hash still matches the trace.
    pub fn verify_integrity(&self) -> bool {
        compute_trace_hash(&self.trace) == self.trace_hash
    }

    pub fn summary(&self) -> InvestigationSummary {
        InvestigationSummary {
            investigation_id: self.investigation_id,
            session_id: self.session_id.clone(),
            query: self.query.clone(),
            classification: self.trace.classification.label.clone(),
            tool_calls: self.trace.entries().len(),
            partial: self.trace.is_partial(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvestigationSummary {
    pub investigation_id: Uuid,
    pub session_id: String,
    pub query: String,
    pub classification: String,
    pub tool_calls: usize,
    pub partial: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait InvestigationStore: Send + Sync {
    async fn save(&self, record: InvestigationRecord) -> Result<Uuid>;
    async fn get(&self, investigation_id: Uuid) -> Result<Option<InvestigationRecord>>;
    /// Newest first.
    async fn list(&self, limit: usize) -> Result<Vec<InvestigationSummary>>;
}

/// Spawn the store call and return its handle.
pub fn submit(
    store: Arc<dyn InvestigationStore>,
    record: InvestigationRecord,
) -> JoinHandle<Result<Uuid>> {
    tokio::spawn(async move {
        let id = record.investigation_id;
        let outcome = store.save(record).await;
        match &outcome {
            Ok(_) => info!(investigation_id = %id, "Investigation stored"),
            Err(e) => warn!(investigation_id = %id, error = %e, "Investigation store failed"),
        }
        outcome
    })
}

/// In-memory store for development
pub struct InMemoryInvestigationStore {
    records: Arc<RwLock<HashMap<Uuid, InvestigationRecord>>>,
}

impl InMemoryInvestigationStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryInvestigationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InvestigationStore for InMemoryInvestigationStore {
    async fn save(&self, record: InvestigationRecord) -> Result<Uuid> {
        let id = record.investigation_id;
        self.records.write().await.insert(id, record);
        Ok(id)
    }

    async fn get(&self, investigation_id: Uuid) -> Result<Option<InvestigationRecord>> {
        Ok(self.records.read().await.get(&investigation_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<InvestigationSummary>> {
        let records = self.records.read().await;
        let mut items: Vec<InvestigationSummary> = records.values().map(|r| r.summary()).collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}

/// Postgres-backed store. The table is created on first use.
pub struct PgInvestigationStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgInvestigationStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| OrchestrationError::DatabaseError(e.to_string()))?;
        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS investigations (
                      investigation_id UUID PRIMARY KEY,
                      session_id TEXT NOT NULL,
                      query TEXT NOT NULL,
                      classification TEXT NOT NULL,
                      tool_calls INTEGER NOT NULL,
                      partial BOOLEAN NOT NULL,
                      trace TEXT NOT NULL,
                      conversation TEXT NOT NULL,
                      trace_hash TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_investigations_created
                    ON investigations (created_at DESC);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize investigation schema: {}",
                    e
                ))
            })?;
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> OrchestrationError {
    OrchestrationError::DatabaseError(e.to_string())
}

#[async_trait::async_trait]
impl InvestigationStore for PgInvestigationStore {
    async fn save(&self, record: InvestigationRecord) -> Result<Uuid> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO investigations
              (investigation_id, session_id, query, classification, tool_calls, partial,
               trace, conversation, trace_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.investigation_id)
        .bind(&record.session_id)
        .bind(&record.query)
        .bind(&record.trace.classification.label)
        .bind(record.trace.entries().len() as i32)
        .bind(record.trace.is_partial())
        .bind(serde_json::to_string(record.trace.as_ref())?)
        .bind(serde_json::to_string(&record.conversation)?)
        .bind(&record.trace_hash)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(record.investigation_id)
    }

    async fn get(&self, investigation_id: Uuid) -> Result<Option<InvestigationRecord>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT investigation_id, session_id, query, trace, conversation, trace_hash, created_at
            FROM investigations
            WHERE investigation_id = $1
            "#,
        )
        .bind(investigation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let trace: String = row.try_get("trace").map_err(db_error)?;
        let conversation: String = row.try_get("conversation").map_err(db_error)?;

        Ok(Some(InvestigationRecord {
            investigation_id: row.try_get("investigation_id").map_err(db_error)?,
            session_id: row.try_get("session_id").map_err(db_error)?,
            query: row.try_get("query").map_err(db_error)?,
            trace: Arc::new(serde_json::from_str(&trace)?),
            conversation: serde_json::from_str(&conversation)?,
            trace_hash: row.try_get("trace_hash").map_err(db_error)?,
            created_at: row.try_get("created_at").map_err(db_error)?,
        }))
    }

    async fn list(&self, limit: usize) -> Result<Vec<InvestigationSummary>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT investigation_id, session_id, query, classification, tool_calls, partial, created_at
            FROM investigations
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                Ok(InvestigationSummary {
                    investigation_id: row.try_get("investigation_id").map_err(db_error)?,
                    session_id: row.try_get("session_id").map_err(db_error)?,
                    query: row.try_get("query").map_err(db_error)?,
                    classification: row.try_get("classification").map_err(db_error)?,
                    tool_calls: row.try_get::<i32, _>("tool_calls").map_err(db_error)? as usize,
                    partial: row.try_get("partial").map_err(db_error)?,
                    created_at: row.try_get("created_at").map_err(db_error)?,
                })
            })
            .collect()
    }
}

/// Postgres when a URL is configured and usable, in-memory otherwise.
pub fn build_store(database_url: Option<&str>) -> Arc<dyn InvestigationStore> {
    if let Some(url) = database_url {
        match PgInvestigationStore::connect_lazy(url) {
            Ok(store) => {
                info!("Investigation store: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres investigation store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Investigation store: in-memory");
    Arc::new(InMemoryInvestigationStore::new())
}

/// SHA-256 of a trace, streamed straight from the serializer.
pub fn compute_trace_hash(trace: &Trace) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), trace).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

struct HashWriter<'a, H: Digest>(&'a mut H);

impl<H: Digest> Write for HashWriter<'_, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
