//! Key-value persistence for behaviour rows, reading sessions, job history
//! and cached chapter page lists.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use super::error::Result;

pub fn source_behavior_key(source_id: &str) -> String {
    format!("source_behavior:{}", source_id)
}

pub fn reading_session_key(source_id: &str, chapter_id: &str, start_ms: u64) -> String {
    format!("reading_session:{}:{}:{}", source_id, chapter_id, start_ms)
}

pub fn prefetch_history_key(job_id: &str) -> String {
    format!("prefetch_history:{}", job_id)
}

pub fn chapter_pages_key(chapter_id: &str) -> String {
    format!("chapter_pages:{}", chapter_id)
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

thread_local! {
    static CLOCK_ANCHOR: (u64, tokio::time::Instant) = (wall_clock_ms(), tokio::time::Instant::now());
}

/// Milliseconds since the epoch. Persisted timestamps and cooldowns use this.
///
/// Advances with tokio's clock from a per-thread wall-clock anchor, so a paused
/// runtime sees cooldowns expire as its timers fire.
pub fn now_ms() -> u64 {
    CLOCK_ANCHOR.with(|(epoch_ms, start)| {
        epoch_ms + tokio::time::Instant::now().saturating_duration_since(*start).as_millis() as u64
    })
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or wholesale overwrite.
    async fn put(&self, key: &str, record: Value) -> Result<()>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>>;
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, record: Value) -> Result<()> {
        self.inner.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database; a single connection so every query sees it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let text: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, record: Value) -> Result<()> {
        let text = serde_json::to_string(&record)?;
        sqlx::query(
            "INSERT INTO records (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(text)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT key, value FROM records WHERE substr(key, 1, ?) = ? ORDER BY key")
            .bind(prefix.len() as i64)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let text: String = row.try_get("value")?;
            match serde_json::from_str(&text) {
                Ok(value) => out.push((key, value)),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", key, e),
            }
        }
        Ok(out)
    }
}

enum PersistCommand {
    Put { key: String, record: Value },
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget write queue. Writes are applied in order by one background
/// task; failures are logged and dropped.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistQueue {
    pub fn spawn(storage: Arc<dyn Storage>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    PersistCommand::Put { key, record } => {
                        if let Err(e) = storage.put(&key, record).await {
                            log::warn!("Failed to persist {}: {}", key, e);
                        }
                    }
                    PersistCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    pub fn put(&self, key: String, record: Value) {
        if self.tx.send(PersistCommand::Put { key, record }).is_err() {
            log::warn!("Persistence queue closed, dropping write");
        }
    }

    pub fn put_serialized<T: serde::Serialize>(&self, key: String, record: &T) {
        match serde_json::to_value(record) {
            Ok(value) => self.put(key, value),
            Err(e) => log::warn!("Failed to serialize {}: {}", key, e),
        }
    }

    /// Resolves once every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}
