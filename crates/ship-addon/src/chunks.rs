//! Ephemeral, shared buffer for publish-task log fragments.
//!
//! Chunks arrive in any order and may be redelivered. They live until their TTL
//! elapses; assembly reads them without consuming them, so a replayed assembly
//! sees the same set.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use sqlx::{Pool, Postgres};
use std::{collections::{BTreeMap, HashMap}, sync::Mutex, time::Duration};
use crate::telemetry::CHUNK_GC_DELETED;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogChunk { pub task_id: String, pub position: i32, pub content: String }

/// Key of the per-task chunk counter in the ephemeral store.
pub fn chunk_count_key(task_id: &str) -> String { format!("{task_id}_chunk_count") }

#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Creates (or resets) the chunk counter for a task.
    async fn init_counter(&self, task_id: &str, ttl: Duration) -> anyhow::Result<()>;
    /// Number of chunks appended since the counter was initialized; `None` when no live counter exists.
    async fn counter(&self, task_id: &str) -> anyhow::Result<Option<i64>>;
    async fn append(&self, chunk: &LogChunk, ttl: Duration) -> anyhow::Result<()>;
    /// Every live chunk of the task, in arrival order.
    async fn chunks(&self, task_id: &str) -> anyhow::Result<Vec<LogChunk>>;
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledLog { pub distinct_positions: usize, pub content: String }

/// Orders chunks by position. The first delivery of a position wins, so the
/// result depends only on the chunk set and its arrival order per position.
pub fn assemble(chunks: &[LogChunk]) -> AssembledLog {
    let mut by_position: BTreeMap<i32, &str> = BTreeMap::new();
    for c in chunks { by_position.entry(c.position).or_insert(c.content.as_str()); }
    let content = by_position.values().copied().collect::<String>();
    AssembledLog { distinct_positions: by_position.len(), content }
}

fn expiry(ttl: Duration) -> anyhow::Result<DateTime<Utc>> {
    Ok(Utc::now() + chrono::Duration::from_std(ttl)?)
}

#[derive(Clone, Debug)]
pub struct PgChunkStore { pool: Pool<Postgres> }

impl PgChunkStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
}

#[async_trait]
impl ChunkStore for PgChunkStore {
    async fn init_counter(&self, task_id: &str, ttl: Duration) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO ephemeral_counters (key, value, expires_at) VALUES ($1, 0, $2) ON CONFLICT (key) DO UPDATE SET value = 0, expires_at = EXCLUDED.expires_at")
            .bind(chunk_count_key(task_id))
            .bind(expiry(ttl)?)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn counter(&self, task_id: &str) -> anyhow::Result<Option<i64>> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT value FROM ephemeral_counters WHERE key = $1 AND expires_at > now()")
            .bind(chunk_count_key(task_id))
            .fetch_optional(&self.pool).await?)
    }

    async fn append(&self, chunk: &LogChunk, ttl: Duration) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO log_chunks (task_id, chunk_position, content, expires_at) VALUES ($1,$2,$3,$4)")
            .bind(&chunk.task_id)
            .bind(chunk.position)
            .bind(&chunk.content)
            .bind(expiry(ttl)?)
            .execute(&self.pool).await?;
        sqlx::query("UPDATE ephemeral_counters SET value = value + 1 WHERE key = $1 AND expires_at > now()")
            .bind(chunk_count_key(&chunk.task_id))
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn chunks(&self, task_id: &str) -> anyhow::Result<Vec<LogChunk>> {
        Ok(sqlx::query_as::<_, LogChunk>("SELECT task_id, chunk_position AS position, content FROM log_chunks WHERE task_id = $1 AND expires_at > now() ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool).await?)
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let chunks = sqlx::query_scalar::<_, i64>("WITH del AS (DELETE FROM log_chunks WHERE expires_at <= now() RETURNING 1) SELECT COUNT(*) FROM del")
            .fetch_one(&self.pool).await?;
        let counters = sqlx::query_scalar::<_, i64>("WITH del AS (DELETE FROM ephemeral_counters WHERE expires_at <= now() RETURNING 1) SELECT COUNT(*) FROM del")
            .fetch_one(&self.pool).await?;
        let deleted = (chunks + counters).max(0) as u64;
        if deleted > 0 { CHUNK_GC_DELETED.inc_by(deleted); }
        Ok(deleted)
    }
}

/// Process-local store. Only correct for a single instance; used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    counters: Mutex<HashMap<String, (i64, DateTime<Utc>)>>,
    chunks: Mutex<Vec<(LogChunk, DateTime<Utc>)>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self { Self::default() }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> anyhow::Error { anyhow::anyhow!("chunk store lock poisoned") }

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn init_counter(&self, task_id: &str, ttl: Duration) -> anyhow::Result<()> {
        let expires = expiry(ttl)?;
        self.counters.lock().map_err(poisoned)?.insert(chunk_count_key(task_id), (0, expires));
        Ok(())
    }

    async fn counter(&self, task_id: &str) -> anyhow::Result<Option<i64>> {
        let now = Utc::now();
        let guard = self.counters.lock().map_err(poisoned)?;
        Ok(guard.get(&chunk_count_key(task_id)).filter(|(_, exp)| *exp > now).map(|(v, _)| *v))
    }

    async fn append(&self, chunk: &LogChunk, ttl: Duration) -> anyhow::Result<()> {
        let expires = expiry(ttl)?;
        self.chunks.lock().map_err(poisoned)?.push((chunk.clone(), expires));
        let now = Utc::now();
        if let Some((count, exp)) = self.counters.lock().map_err(poisoned)?.get_mut(&chunk_count_key(&chunk.task_id)) {
            if *exp > now { *count += 1; }
        }
        Ok(())
    }

    async fn chunks(&self, task_id: &str) -> anyhow::Result<Vec<LogChunk>> {
        let now = Utc::now();
        let guard = self.chunks.lock().map_err(poisoned)?;
        Ok(guard.iter().filter(|(c, exp)| c.task_id == task_id && *exp > now).map(|(c, _)| c.clone()).collect())
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut chunks = self.chunks.lock().map_err(poisoned)?;
        let before = chunks.len();
        chunks.retain(|(_, exp)| *exp > now);
        let mut deleted = before - chunks.len();
        drop(chunks);
        let mut counters = self.counters.lock().map_err(poisoned)?;
        let before = counters.len();
        counters.retain(|_, (_, exp)| *exp > now);
        deleted += before - counters.len();
        Ok(deleted as u64)
    }
}
