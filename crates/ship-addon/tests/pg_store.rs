//! Postgres-backed store, chunk store and job queue. Skipped unless DATABASE_URL is set.
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use ship_addon::chunks::{assemble, ChunkStore, LogChunk, PgChunkStore};
use ship_addon::config::{WorkerConfig, WorkerMode};
use ship_addon::db::init_db;
use ship_addon::error::StoreError;
use ship_addon::models::{App, ArtifactInfo, EventStatus, NewAppVersion, NewAppVersionEvent, Platform};
use ship_addon::services::{AppService, AppVersionEventService, AppVersionService, PgStore, PublishTaskService};
use ship_addon::worker::{Job, PgJobQueue, WorkerEnqueuer};
use sqlx::{Pool, Postgres};

async fn pool() -> Option<Pool<Postgres>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = init_db(&url, 5).await.expect("database reachable");
    for table in ["jobs", "log_chunks", "ephemeral_counters", "publish_tasks", "app_version_events", "app_versions", "app_contacts", "app_settings", "apps"] {
        sqlx::query(&format!("DELETE FROM {table}")).execute(&pool).await.unwrap();
    }
    Some(pool)
}

async fn seed_app(pool: &Pool<Postgres>) -> App {
    sqlx::query_as::<_, App>("INSERT INTO apps (app_slug, ci_api_token) VALUES ('ship-app', 'tok') RETURNING id, app_slug, ci_api_token, created_at")
        .fetch_one(pool).await.unwrap()
}

fn new_version(app: &App, build_slug: &str) -> NewAppVersion {
    NewAppVersion {
        app_id: app.id,
        platform: Platform::Android,
        version: "1.0".into(),
        build_number: 1,
        build_slug: build_slug.into(),
        app_info: Default::default(),
        provisioning_info: Default::default(),
        store_info: json!({"title": "Ship"}),
        artifact_info: ArtifactInfo::default(),
        last_update: Utc::now(),
    }
}

#[tokio::test]
#[serial_test::serial]
async fn versions_are_unique_per_build_and_latest_wins() {
    let Some(pool) = pool().await else { return };
    let store = PgStore::new(pool.clone());
    let app = seed_app(&pool).await;
    assert_eq!(store.find_by_slug("ship-app").await.unwrap().map(|a| a.id), Some(app.id));

    let first = AppVersionService::create(&store, &new_version(&app, "b1")).await.unwrap();
    let second = AppVersionService::create(&store, &new_version(&app, "b2")).await.unwrap();
    let latest = store.latest(app.id, Platform::Android).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
    assert_eq!(latest.store_info, json!({"title": "Ship"}));
    assert!(store.latest(app.id, Platform::Ios).await.unwrap().is_none());

    let dup = AppVersionService::create(&store, &new_version(&app, "b1")).await.unwrap_err();
    assert!(matches!(dup, StoreError::Validation(_)));
    assert_eq!(store.find_by_build(app.id, "b1", Platform::Android).await.unwrap().map(|v| v.id), Some(first.id));

    let ev = AppVersionEventService::create(&store, &NewAppVersionEvent::new(first.id, EventStatus::InProgress, "Version created")).await.unwrap();
    assert_eq!(ev.status(), Some(EventStatus::InProgress));
    assert_eq!(store.list_for_version(first.id).await.unwrap().len(), 1);

    sqlx::query("INSERT INTO publish_tasks (task_id, app_version_id) VALUES ('t1', $1)").bind(first.id).execute(&pool).await.unwrap();
    assert_eq!(store.find_by_task_id("t1").await.unwrap().map(|t| t.app_version_id), Some(first.id));
}

#[tokio::test]
#[serial_test::serial]
async fn chunk_store_counts_orders_and_expires() {
    let Some(pool) = pool().await else { return };
    let chunks = PgChunkStore::new(pool);
    let ttl = Duration::from_secs(60);
    chunks.init_counter("t1", ttl).await.unwrap();
    for (pos, text) in [(2, "b"), (1, "a"), (2, "b")] {
        chunks.append(&LogChunk { task_id: "t1".into(), position: pos, content: text.into() }, ttl).await.unwrap();
    }
    assert_eq!(chunks.counter("t1").await.unwrap(), Some(3));
    let log = assemble(&chunks.chunks("t1").await.unwrap());
    assert_eq!((log.content.as_str(), log.distinct_positions), ("ab", 2));

    chunks.append(&LogChunk { task_id: "t2".into(), position: 1, content: "x".into() }, Duration::ZERO).await.unwrap();
    assert!(chunks.chunks("t2").await.unwrap().is_empty());
    assert!(chunks.purge_expired().await.unwrap() >= 1);
}

#[tokio::test]
#[serial_test::serial]
async fn job_queue_claims_once_and_retries_then_gives_up() {
    let Some(pool) = pool().await else { return };
    let cfg = WorkerConfig { mode: WorkerMode::Queue, poll_interval: Duration::from_millis(10), max_attempts: 2, retry_delay: Duration::ZERO };
    let queue = PgJobQueue::new(pool.clone(), &cfg);
    queue.enqueue_store_log("t1", 2, "logs/a/b/c.log", Duration::from_secs(600)).await.unwrap();

    let claimed = queue.claim().await.unwrap().expect("job claimable");
    assert!(matches!(claimed.job, Job::StoreLog { chunk_count: 2, .. }));
    assert!(queue.claim().await.unwrap().is_none());

    assert!(queue.fail(&claimed, "incomplete").await.unwrap());
    let retry = queue.claim().await.unwrap().expect("requeued");
    assert_eq!(retry.attempts, 2);
    assert!(!queue.fail(&retry, "incomplete").await.unwrap());
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1").bind(retry.id).fetch_one(&pool).await.unwrap();
    assert_eq!(status, "failed");
}
