use axum::{body::Body, http::{Request, StatusCode}};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tower::util::ServiceExt;
use uuid::Uuid;
use ship_addon::build_router;
use ship_addon::chunks::ChunkStore;
use ship_addon::models::{AppVersion, ArtifactInfo, EventStatus, NewAppVersion, Platform};
use ship_addon::services::AppVersionService;
use ship_addon::task_status::log_path;
use ship_addon::test_support::{ios_app_info, TestHarness};
use ship_addon::worker::Job;

async fn post(h: &TestHarness, body: Value) -> (StatusCode, Value) {
    post_raw(h, body.to_string()).await
}

async fn post_raw(h: &TestHarness, body: String) -> (StatusCode, Value) {
    let req = Request::builder().method("POST").uri("/task-webhook").header("content-type", "application/json").body(Body::from(body)).unwrap();
    let res = build_router(h.state()).oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn seeded() -> (TestHarness, AppVersion) {
    let h = TestHarness::new();
    let app = h.store.add_app("ship-app");
    let new = NewAppVersion {
        app_id: app.id,
        platform: Platform::Ios,
        version: "1.0".into(),
        build_number: 42,
        build_slug: "build-1".into(),
        app_info: ios_app_info("1.0", &[1, 2]),
        provisioning_info: Default::default(),
        store_info: json!({}),
        artifact_info: ArtifactInfo::default(),
        last_update: Utc::now(),
    };
    let version = AppVersionService::create(&*h.store, &new).await.unwrap();
    h.store.add_task("task-1", version.id);
    (h, version)
}

fn status_hook(new_status: &str, exit_code: Option<i32>, chunks: Option<i64>) -> Value {
    json!({"type_id": "status", "timestamp": 1700000000, "task_id": "task-1",
           "data": {"new_status": new_status, "exit_code": exit_code, "generated_log_chunk_count": chunks, "finished_at": 1700000100}})
}

fn log_hook(position: i32, chunk: &str) -> Value {
    json!({"type_id": "log", "timestamp": 1700000000, "task_id": "task-1", "data": {"position": position, "chunk": chunk}})
}

async fn counter(h: &TestHarness, task_id: &str) -> Option<i64> {
    h.chunks.counter(task_id).await.unwrap()
}

fn store_log_jobs(h: &TestHarness) -> Vec<Job> {
    h.worker.jobs().into_iter().filter(|j| matches!(j, Job::StoreLog { .. })).collect()
}

#[tokio::test]
async fn started_then_finished_records_two_events_and_one_assembly_job() {
    let (h, version) = seeded().await;
    let (status, body) = post(&h, status_hook("started", None, None)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "in_progress");
    assert_eq!(counter(&h, "task-1").await, Some(0));

    let (status, body) = post(&h, status_hook("finished", Some(0), Some(2))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "success");

    let events = h.store.events();
    assert_eq!(events.iter().map(|e| e.status()).collect::<Vec<_>>(), vec![Some(EventStatus::InProgress), Some(EventStatus::Success)]);
    assert_eq!(events[0].text, "Publishing has started");
    assert_eq!(events[1].text, "Successfully published");

    let jobs = store_log_jobs(&h);
    assert_eq!(jobs.len(), 1);
    let Job::StoreLog { task_id, chunk_count, path, .. } = &jobs[0] else { unreachable!() };
    assert_eq!(task_id, "task-1");
    assert_eq!(*chunk_count, 2);
    assert_eq!(path, &log_path("ship-app", version.id, events[1].id));
}

#[tokio::test]
async fn unknown_status_is_rejected_without_event() {
    let (h, _) = seeded().await;
    let (status, body) = post(&h, status_hook("unknown", None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_status");
    assert!(h.store.events().is_empty());
}

#[tokio::test]
async fn unknown_type_and_malformed_data_are_client_errors() {
    let (h, _) = seeded().await;
    let (status, body) = post(&h, json!({"type_id": "metrics", "task_id": "task-1", "data": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_webhook_type");

    let (status, body) = post(&h, json!({"type_id": "log", "task_id": "task-1", "data": {"position": "first", "chunk": 1}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");

    let (status, _) = post_raw(&h, "not json".into()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.worker.jobs().is_empty());
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (h, _) = seeded().await;
    let mut hook = log_hook(1, "x");
    hook["task_id"] = json!("task-404");
    let (status, body) = post(&h, hook).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn out_of_order_chunks_are_stored_as_one_ordered_log() {
    let (h, version) = seeded().await;
    post(&h, status_hook("started", None, None)).await;
    for (pos, text) in [(3, "three\n"), (1, "one\n"), (2, "two\n")] {
        let (status, body) = post(&h, log_hook(pos, text)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["kind"], "log");
    }
    assert_eq!(counter(&h, "task-1").await, Some(3));
    let (status, body) = post(&h, status_hook("finished", Some(0), Some(3))).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let event_id: Uuid = serde_json::from_value(body["data"]["event_id"].clone()).unwrap();
    let stored = h.storage.object(&log_path("ship-app", version.id, event_id)).expect("log stored");
    assert_eq!(stored.body, b"one\ntwo\nthree\n");
}

#[tokio::test]
async fn finished_before_chunks_arrive_leaves_log_unwritten() {
    let (h, version) = seeded().await;
    post(&h, status_hook("started", None, None)).await;
    post(&h, log_hook(1, "one\n")).await;
    let (status, body) = post(&h, status_hook("finished", Some(0), Some(2))).await;
    assert_eq!(status, StatusCode::OK);
    let event_id: Uuid = serde_json::from_value(body["data"]["event_id"].clone()).unwrap();
    assert!(h.storage.object(&log_path("ship-app", version.id, event_id)).is_none());
    assert_eq!(store_log_jobs(&h).len(), 1);
}

#[tokio::test]
async fn finished_without_started_is_tolerated() {
    let (h, _) = seeded().await;
    let (status, body) = post(&h, status_hook("finished", Some(1), Some(0))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "failed");
    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].text, "Failed to publish");
    assert_eq!(store_log_jobs(&h).len(), 1);
}

#[tokio::test]
async fn finished_without_exit_code_is_bad_request() {
    let (h, _) = seeded().await;
    let (status, body) = post(&h, status_hook("finished", None, Some(2))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
    assert!(h.store.events().is_empty());
}

#[tokio::test]
async fn chunk_enqueue_failure_is_worker_error() {
    let (h, _) = seeded().await;
    h.worker.fail.store(true, Ordering::SeqCst);
    let (status, body) = post(&h, log_hook(1, "x")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "worker");
}
