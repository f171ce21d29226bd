//! Persistence backends: append-only replay logs for the ledgers and the
//! PostgreSQL mirror for the audit chain.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::audit::{AuditChain, AuditEntry, AuditEvent, AuditSink};
use crate::error::StorageError;

enum ReplayBackend<E> {
    Memory(Mutex<Vec<E>>),
    File { path: PathBuf, lock: Mutex<()> },
}

/// Append-only event log a ledger replays on restart.
///
/// The file backend writes one JSON document per line and syncs after every
/// append, so an event is durable before the ledger commits it in memory.
pub struct ReplayLog<E> {
    backend: ReplayBackend<E>,
}

impl<E> ReplayLog<E>
where
    E: Serialize + DeserializeOwned + Clone,
{
    pub fn memory() -> Self {
        Self {
            backend: ReplayBackend::Memory(Mutex::new(Vec::new())),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            backend: ReplayBackend::File {
                path,
                lock: Mutex::new(()),
            },
        })
    }

    pub fn label(&self) -> &'static str {
        match self.backend {
            ReplayBackend::Memory(_) => "memory",
            ReplayBackend::File { .. } => "file",
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            ReplayBackend::Memory(_) => None,
            ReplayBackend::File { path, .. } => Some(path),
        }
    }

    pub fn append(&self, event: &E) -> Result<(), StorageError> {
        match &self.backend {
            ReplayBackend::Memory(events) => {
                events
                    .lock()
                    .map_err(|_| StorageError::LockPoisoned("replay log"))?
                    .push(event.clone());
                Ok(())
            }
            ReplayBackend::File { path, lock } => {
                let _guard = lock
                    .lock()
                    .map_err(|_| StorageError::LockPoisoned("replay log"))?;
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(&line)?;
                file.sync_data()?;
                Ok(())
            }
        }
    }

    /// All events in append order.
    pub fn events(&self) -> Result<Vec<E>, StorageError> {
        match &self.backend {
            ReplayBackend::Memory(events) => Ok(events
                .lock()
                .map_err(|_| StorageError::LockPoisoned("replay log"))?
                .clone()),
            ReplayBackend::File { path, lock } => {
                let _guard = lock
                    .lock()
                    .map_err(|_| StorageError::LockPoisoned("replay log"))?;
                if !path.exists() {
                    return Ok(Vec::new());
                }
                let reader = BufReader::new(File::open(path)?);
                let mut events = Vec::new();
                for (line_no, line) in reader.lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = serde_json::from_str(&line).map_err(|e| {
                        StorageError::Integrity(format!(
                            "{}: line {} is not a valid event: {e}",
                            path.display(),
                            line_no + 1
                        ))
                    })?;
                    events.push(event);
                }
                Ok(events)
            }
        }
    }
}

/// Audit persistence backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuditStorageConfig {
    /// Keep the audit chain in process memory only.
    #[default]
    Memory,
    /// Mirror every entry to PostgreSQL and hydrate the chain on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl AuditStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
enum AuditBackend {
    Memory,
    Postgres(PostgresAuditStore),
}

/// Audit sink with an authoritative in-memory chain, optionally mirrored to
/// PostgreSQL.
///
/// Entries are persisted before they are committed in memory; on startup the
/// persisted chain is hydrated and hash-verified.
pub struct PersistentAuditSink {
    chain: AsyncMutex<AuditChain>,
    backend: AuditBackend,
}

impl PersistentAuditSink {
    pub async fn bootstrap(config: AuditStorageConfig) -> Result<Self, StorageError> {
        match config {
            AuditStorageConfig::Memory => Ok(Self {
                chain: AsyncMutex::new(AuditChain::new()),
                backend: AuditBackend::Memory,
            }),
            AuditStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresAuditStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                let entries = store.load_entries().await?;
                let chain = AuditChain::from_entries(entries)?;
                tracing::info!(entries = chain.len(), "audit chain hydrated from postgres");
                Ok(Self {
                    chain: AsyncMutex::new(chain),
                    backend: AuditBackend::Postgres(store),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            AuditBackend::Memory => "memory",
            AuditBackend::Postgres(_) => "postgres",
        }
    }

    pub async fn verify_chain(&self) -> bool {
        self.chain.lock().await.verify_chain()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.chain.lock().await.entries().to_vec()
    }
}

#[async_trait::async_trait]
impl AuditSink for PersistentAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry, StorageError> {
        let mut chain = self.chain.lock().await;
        let entry = chain.build_entry(event)?;

        if let AuditBackend::Postgres(store) = &self.backend {
            store.insert_entry(&entry).await?;
        }

        chain.commit_entry(entry.clone())?;
        Ok(entry)
    }

    async fn query(&self, trace_id: &str) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self.chain.lock().await.query(trace_id))
    }
}

#[derive(Debug, Clone)]
struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Database(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intersect_audit_entries (
                audit_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                trace_id TEXT NOT NULL,
                envelope_id TEXT NULL,
                payload JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_intersect_audit_trace_id ON intersect_audit_entries (trace_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<AuditEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT audit_index, entry_id, payload, recorded_at, previous_hash, entry_hash
            FROM intersect_audit_entries
            ORDER BY audit_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(format!("postgres load failed: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = row
                .try_get("audit_index")
                .map_err(|e| decode_error("audit_index", e))?;
            let payload: serde_json::Value =
                row.try_get("payload").map_err(|e| decode_error("payload", e))?;
            let event: AuditEvent = serde_json::from_value(payload)?;

            entries.push(AuditEntry {
                entry_id: row.try_get("entry_id").map_err(|e| decode_error("entry_id", e))?,
                index: index
                    .try_into()
                    .map_err(|_| StorageError::Integrity("negative audit index in storage".to_string()))?,
                recorded_at: row
                    .try_get("recorded_at")
                    .map_err(|e| decode_error("recorded_at", e))?,
                event,
                previous_hash: row
                    .try_get("previous_hash")
                    .map_err(|e| decode_error("previous_hash", e))?,
                entry_hash: row
                    .try_get("entry_hash")
                    .map_err(|e| decode_error("entry_hash", e))?,
            });
        }

        Ok(entries)
    }

    async fn insert_entry(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        let index: i64 = entry.index.try_into().map_err(|_| {
            StorageError::Integrity("audit index exceeds postgres BIGINT range".to_string())
        })?;
        let payload = serde_json::to_value(&entry.event)?;

        sqlx::query(
            r#"
            INSERT INTO intersect_audit_entries (
                audit_index, entry_id, trace_id, envelope_id, payload,
                recorded_at, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(index)
        .bind(&entry.entry_id)
        .bind(&entry.event.trace_id)
        .bind(&entry.event.envelope_id)
        .bind(payload)
        .bind(entry.recorded_at)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(format!("postgres insert failed: {e}")))?;

        Ok(())
    }
}

fn decode_error(column: &str, err: sqlx::Error) -> StorageError {
    StorageError::Database(format!("postgres decode {column} failed: {err}"))
}
