//! Background jobs: the enqueue contract used by the webhook pipeline, a
//! Postgres-backed queue with a polling worker, and the executor that runs jobs.
//!
//! Jobs run at least once. Every job body is idempotent: chunk appends are
//! deduplicated at assembly, log uploads overwrite the same key with the same
//! bytes, and asset copies overwrite their targets.
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Postgres};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::chunks::{assemble, ChunkStore, LogChunk};
use crate::config::WorkerConfig;
use crate::storage::ObjectStorage;
use crate::telemetry::{JOBS_ENQUEUED, JOBS_PROCESSED};

/// Claims older than this are considered abandoned by a crashed worker.
const STALE_CLAIM_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    CopyUploadables { from: Uuid, to: Uuid },
    StoreLogChunk { chunk: LogChunk, ttl_secs: u64 },
    StoreLog { task_id: String, chunk_count: i64, path: String, ttl_secs: u64 },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::CopyUploadables { .. } => "copy_uploadables",
            Job::StoreLogChunk { .. } => "store_log_chunk",
            Job::StoreLog { .. } => "store_log",
        }
    }

    /// Window in which the job is still worth retrying; chunk-bound jobs are useless once the chunks expire.
    pub fn retry_horizon(&self) -> Option<Duration> {
        match self {
            Job::CopyUploadables { .. } => None,
            Job::StoreLogChunk { ttl_secs, .. } | Job::StoreLog { ttl_secs, .. } => Some(Duration::from_secs(*ttl_secs)),
        }
    }
}

/// Fire-and-forget handle to the job runner. `enqueue` returns once the job is
/// accepted; execution happens later.
#[async_trait]
pub trait WorkerEnqueuer: Send + Sync + 'static {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;

    async fn enqueue_copy_uploadables(&self, from: Uuid, to: Uuid) -> anyhow::Result<()> {
        submit(self, Job::CopyUploadables { from, to }).await
    }

    async fn enqueue_store_log_chunk(&self, chunk: LogChunk, ttl: Duration) -> anyhow::Result<()> {
        submit(self, Job::StoreLogChunk { chunk, ttl_secs: ttl.as_secs() }).await
    }

    async fn enqueue_store_log(&self, task_id: &str, chunk_count: i64, path: &str, ttl: Duration) -> anyhow::Result<()> {
        submit(self, Job::StoreLog { task_id: task_id.to_string(), chunk_count, path: path.to_string(), ttl_secs: ttl.as_secs() }).await
    }
}

async fn submit<E: WorkerEnqueuer + ?Sized>(enqueuer: &E, job: Job) -> anyhow::Result<()> {
    let kind = job.kind();
    enqueuer.enqueue(job).await.with_context(|| format!("enqueue {kind}"))?;
    JOBS_ENQUEUED.with_label_values(&[kind]).inc();
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ClaimedJob { pub id: i64, pub attempts: i32, pub created_at: DateTime<Utc>, pub job: Job }

#[derive(sqlx::FromRow)]
struct JobRow { id: i64, attempts: i32, created_at: DateTime<Utc>, payload: serde_json::Value }

#[derive(Clone, Debug)]
pub struct PgJobQueue { pool: Pool<Postgres>, max_attempts: i32, retry_delay: Duration }

impl PgJobQueue {
    pub fn new(pool: Pool<Postgres>, cfg: &WorkerConfig) -> Self {
        Self { pool, max_attempts: cfg.max_attempts.max(1), retry_delay: cfg.retry_delay }
    }

    /// Atomically claims the oldest runnable job, or a stale claim left by a dead worker.
    pub async fn claim(&self) -> anyhow::Result<Option<ClaimedJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH claimable AS (
                SELECT id FROM jobs
                WHERE (status = 'queued' AND run_after <= now())
                   OR (status = 'running' AND updated_at < now() - make_interval(secs => $1))
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'running', attempts = j.attempts + 1, updated_at = now()
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.id, j.attempts, j.created_at, j.payload
            "#,
        )
        .bind(STALE_CLAIM_SECS as f64)
        .fetch_optional(&self.pool).await?;
        let Some(row) = row else { return Ok(None) };
        match serde_json::from_value::<Job>(row.payload) {
            Ok(job) => Ok(Some(ClaimedJob { id: row.id, attempts: row.attempts, created_at: row.created_at, job })),
            Err(e) => {
                // undecodable payloads can never succeed
                self.mark_failed(row.id, &format!("undecodable payload: {e}")).await?;
                Ok(None)
            }
        }
    }

    pub async fn complete(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = 'done', last_error = NULL, updated_at = now() WHERE id = $1")
            .bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Requeues with a linear backoff, or gives up once attempts or the job's horizon run out.
    pub async fn fail(&self, claimed: &ClaimedJob, error: &str) -> anyhow::Result<bool> {
        let past_horizon = claimed.job.retry_horizon()
            .and_then(|h| chrono::Duration::from_std(h).ok())
            .map(|h| claimed.created_at + h <= Utc::now())
            .unwrap_or(false);
        if claimed.attempts >= self.max_attempts || past_horizon {
            self.mark_failed(claimed.id, error).await?;
            return Ok(false);
        }
        let delay = self.retry_delay.as_secs_f64() * f64::from(claimed.attempts.max(1));
        sqlx::query("UPDATE jobs SET status = 'queued', last_error = $2, run_after = now() + make_interval(secs => $3), updated_at = now() WHERE id = $1")
            .bind(claimed.id)
            .bind(error)
            .bind(delay)
            .execute(&self.pool).await?;
        Ok(true)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = 'failed', last_error = $2, updated_at = now() WHERE id = $1")
            .bind(id).bind(error).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerEnqueuer for PgJobQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO jobs (kind, payload) VALUES ($1, $2)")
            .bind(job.kind())
            .bind(sqlx::types::Json(&job))
            .execute(&self.pool).await?;
        Ok(())
    }
}

/// Runs jobs against the chunk store and durable storage.
#[derive(Clone)]
pub struct JobExecutor { chunks: Arc<dyn ChunkStore>, storage: Arc<dyn ObjectStorage> }

impl JobExecutor {
    pub fn new(chunks: Arc<dyn ChunkStore>, storage: Arc<dyn ObjectStorage>) -> Self { Self { chunks, storage } }

    pub async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        match job {
            Job::StoreLogChunk { chunk, ttl_secs } => {
                self.chunks.append(chunk, Duration::from_secs(*ttl_secs)).await
            }
            Job::StoreLog { task_id, chunk_count, path, .. } => self.store_log(task_id, *chunk_count, path).await,
            Job::CopyUploadables { from, to } => self.copy_uploadables(*from, *to).await,
        }
    }

    /// Assembles every buffered chunk of the task and writes the log. Chunks are
    /// left in place, so a replay writes identical bytes.
    async fn store_log(&self, task_id: &str, chunk_count: i64, path: &str) -> anyhow::Result<()> {
        let chunks = self.chunks.chunks(task_id).await?;
        let log = assemble(&chunks);
        let expected = usize::try_from(chunk_count.max(0)).unwrap_or(usize::MAX);
        if log.distinct_positions < expected {
            anyhow::bail!("log for task {task_id} incomplete: {} of {chunk_count} chunks buffered", log.distinct_positions);
        }
        let body = log.content.into_bytes();
        let digest = hex::encode(Sha256::digest(&body));
        if self.storage.get_object(path).await?.as_deref() == Some(body.as_slice()) {
            debug!(task_id, path, "publish_log.unchanged");
            return Ok(());
        }
        self.storage.put_object(path, body, "text/plain; charset=utf-8", &digest).await?;
        info!(task_id, path, chunks=expected, sha256=%digest, "publish_log.stored");
        Ok(())
    }

    async fn copy_uploadables(&self, from: Uuid, to: Uuid) -> anyhow::Result<()> {
        let src_prefix = format!("uploadables/{from}/");
        let keys = self.storage.list_keys(&src_prefix).await?;
        for key in &keys {
            let target = format!("uploadables/{to}/{}", &key[src_prefix.len()..]);
            self.storage.copy_object(key, &target).await.with_context(|| format!("copy {key}"))?;
        }
        info!(%from, %to, copied=keys.len(), "uploadables.copied");
        Ok(())
    }
}

/// Runs jobs in the calling task. Used for local runs and tests; execution errors
/// are logged, never returned, so callers see the same contract as a real queue.
#[derive(Clone)]
pub struct InlineEnqueuer { executor: JobExecutor }

impl InlineEnqueuer {
    pub fn new(executor: JobExecutor) -> Self { Self { executor } }
}

#[async_trait]
impl WorkerEnqueuer for InlineEnqueuer {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        let outcome = match self.executor.execute(&job).await {
            Ok(()) => "success",
            Err(e) => { warn!(kind=job.kind(), error=%format!("{e:#}"), "job.inline_failed"); "error" }
        };
        JOBS_PROCESSED.with_label_values(&[job.kind(), outcome]).inc();
        Ok(())
    }
}

/// Polls the queue until the process exits.
pub async fn run_worker(queue: PgJobQueue, executor: JobExecutor, poll_interval: Duration) {
    info!(poll_ms=poll_interval.as_millis() as u64, "worker.started");
    loop {
        match queue.claim().await {
            Ok(Some(claimed)) => process(&queue, &executor, claimed).await,
            Ok(None) => tokio::time::sleep(poll_interval).await,
            Err(e) => {
                warn!(error=%e, "worker.claim_failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

async fn process(queue: &PgJobQueue, executor: &JobExecutor, claimed: ClaimedJob) {
    let kind = claimed.job.kind();
    debug!(job_id=claimed.id, kind, attempt=claimed.attempts, "job.claimed");
    let outcome = match executor.execute(&claimed.job).await {
        Ok(()) => match queue.complete(claimed.id).await {
            Ok(()) => "success",
            Err(e) => { warn!(job_id=claimed.id, error=%e, "job.complete_failed"); "error" }
        },
        Err(e) => {
            let msg = format!("{e:#}");
            match queue.fail(&claimed, &msg).await {
                Ok(true) => { warn!(job_id=claimed.id, kind, attempt=claimed.attempts, error=%msg, "job.retry_scheduled"); "retry" }
                Ok(false) => { warn!(job_id=claimed.id, kind, attempt=claimed.attempts, error=%msg, "job.gave_up"); "failed" }
                Err(db) => { warn!(job_id=claimed.id, error=%db, "job.fail_update_failed"); "error" }
            }
        }
    };
    JOBS_PROCESSED.with_label_values(&[kind, outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::MemoryChunkStore;
    use crate::storage::MemoryObjectStorage;

    fn fixture() -> (Arc<MemoryChunkStore>, Arc<MemoryObjectStorage>, JobExecutor) {
        let chunks = Arc::new(MemoryChunkStore::new());
        let storage = Arc::new(MemoryObjectStorage::new());
        let exec = JobExecutor::new(chunks.clone(), storage.clone());
        (chunks, storage, exec)
    }

    fn chunk(position: i32, content: &str) -> LogChunk {
        LogChunk { task_id: "task-1".into(), position, content: content.into() }
    }

    fn store_log(count: i64) -> Job {
        Job::StoreLog { task_id: "task-1".into(), chunk_count: count, path: "logs/app/v/e.log".into(), ttl_secs: 60 }
    }

    #[test]
    fn jobs_serialize_with_kind_tag() {
        let job = Job::CopyUploadables { from: Uuid::nil(), to: Uuid::nil() };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["kind"], "copy_uploadables");
        assert_eq!(serde_json::from_value::<Job>(v).unwrap(), job);
        assert_eq!(store_log(1).retry_horizon(), Some(Duration::from_secs(60)));
        assert_eq!(job.retry_horizon(), None);
    }

    #[tokio::test]
    async fn assembling_twice_writes_identical_bytes() {
        let (chunks, storage, exec) = fixture();
        for (pos, text) in [(2, "b\n"), (1, "a\n")] {
            chunks.append(&chunk(pos, text), Duration::from_secs(60)).await.unwrap();
        }
        exec.execute(&store_log(2)).await.unwrap();
        let first = storage.object("logs/app/v/e.log").unwrap();
        exec.execute(&store_log(2)).await.unwrap();
        let second = storage.object("logs/app/v/e.log").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.body, b"a\nb\n");
        assert_eq!(first.sha256, hex::encode(Sha256::digest(b"a\nb\n")));
        assert!(first.content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn replay_over_identical_log_skips_upload() {
        let (chunks, storage, exec) = fixture();
        chunks.append(&chunk(1, "a\n"), Duration::from_secs(60)).await.unwrap();
        storage.put_object("logs/app/v/e.log", b"a\n".to_vec(), "seeded", "x").await.unwrap();
        exec.execute(&store_log(1)).await.unwrap();
        assert_eq!(storage.object("logs/app/v/e.log").unwrap().content_type, "seeded");

        storage.put_object("logs/app/v/e.log", b"stale".to_vec(), "seeded", "x").await.unwrap();
        exec.execute(&store_log(1)).await.unwrap();
        let rewritten = storage.object("logs/app/v/e.log").unwrap();
        assert_eq!(rewritten.body, b"a\n");
        assert!(rewritten.content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn incomplete_chunk_set_fails_without_writing() {
        let (chunks, storage, exec) = fixture();
        chunks.append(&chunk(1, "a"), Duration::from_secs(60)).await.unwrap();
        chunks.append(&chunk(1, "a"), Duration::from_secs(60)).await.unwrap();
        let err = exec.execute(&store_log(2)).await.unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert!(storage.object("logs/app/v/e.log").is_none());
    }

    #[tokio::test]
    async fn store_log_chunk_job_appends() {
        let (chunks, _, exec) = fixture();
        exec.execute(&Job::StoreLogChunk { chunk: chunk(4, "x"), ttl_secs: 60 }).await.unwrap();
        assert_eq!(chunks.chunks("task-1").await.unwrap(), vec![chunk(4, "x")]);
    }

    #[tokio::test]
    async fn copy_uploadables_moves_every_asset_under_the_prefix() {
        let (_, storage, exec) = fixture();
        let (from, to) = (Uuid::new_v4(), Uuid::new_v4());
        storage.put_object(&format!("uploadables/{from}/icon.png"), b"i".to_vec(), "image/png", "h1").await.unwrap();
        storage.put_object(&format!("uploadables/{from}/shots/1.png"), b"s".to_vec(), "image/png", "h2").await.unwrap();
        exec.execute(&Job::CopyUploadables { from, to }).await.unwrap();
        let copied = storage.list_keys(&format!("uploadables/{to}/")).await.unwrap();
        assert_eq!(copied, vec![format!("uploadables/{to}/icon.png"), format!("uploadables/{to}/shots/1.png")]);
    }

    #[tokio::test]
    async fn inline_enqueuer_swallows_execution_errors() {
        let (_, _, exec) = fixture();
        let inline = InlineEnqueuer::new(exec);
        inline.enqueue_store_log("task-1", 3, "logs/a/b/c.log", Duration::from_secs(60)).await.unwrap();
    }
}
