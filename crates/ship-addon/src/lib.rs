pub mod build_events;
pub mod build_output;
pub mod chunks;
pub mod ci;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod logging;
pub mod mailer;
pub mod models;
pub mod notify;
pub mod selector;
pub mod services;
pub mod storage;
pub mod task_events;
pub mod task_status;
pub mod telemetry;
pub mod test_support;
pub mod worker;

use axum::{Router, routing::{get, post}};
use std::{sync::Arc, time::Duration};
use handlers::{health::health, readiness::readiness, webhooks::{build_webhook, task_webhook}};
use utoipa::OpenApi;
use crate::build_events::BuildEventRouter;
use crate::chunks::ChunkStore;
use crate::ci::CiClient;
use crate::ingest::VersionIngestor;
use crate::mailer::Mailer;
use crate::notify::NotificationDispatcher;
use crate::services::{AppContactService, AppService, AppVersionEventService, AppVersionService, PublishTaskService, Readiness};
use crate::task_events::PublishTaskRouter;
use crate::task_status::TaskStatusTracker;
use crate::telemetry::metrics_handler;
use crate::worker::WorkerEnqueuer;

/// Everything the pipeline talks to, injected once at boot.
#[derive(Clone)]
pub struct Collaborators {
    pub apps: Arc<dyn AppService>,
    pub versions: Arc<dyn AppVersionService>,
    pub events: Arc<dyn AppVersionEventService>,
    pub tasks: Arc<dyn PublishTaskService>,
    pub contacts: Arc<dyn AppContactService>,
    pub readiness: Arc<dyn Readiness>,
    pub chunks: Arc<dyn ChunkStore>,
    pub worker: Arc<dyn WorkerEnqueuer>,
    pub ci: Arc<dyn CiClient>,
    pub mailer: Arc<dyn Mailer>,
    pub chunk_ttl: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub build_events: Arc<BuildEventRouter>,
    pub task_events: Arc<PublishTaskRouter>,
    pub readiness: Arc<dyn Readiness>,
}

impl AppState {
    pub fn new(c: Collaborators) -> Self {
        let ingestor = VersionIngestor::new(c.versions.clone(), c.events.clone(), c.worker.clone());
        let dispatcher = NotificationDispatcher::new(c.contacts, c.ci.clone(), c.mailer);
        let tracker = TaskStatusTracker::new(c.events, c.chunks, c.worker.clone(), c.chunk_ttl);
        Self {
            build_events: Arc::new(BuildEventRouter::new(c.apps.clone(), c.ci, ingestor, dispatcher)),
            task_events: Arc::new(PublishTaskRouter::new(c.tasks, c.versions, c.apps, tracker, c.worker, c.chunk_ttl)),
            readiness: c.readiness,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::webhooks::build_webhook,
        handlers::webhooks::task_webhook,
    ),
    components(schemas(
        error::ApiErrorBody,
        models::Platform,
        models::EventStatus,
        build_events::BuildWebhookPayload,
        build_events::BuildWebhookReport,
        build_events::IngestedVersion,
        build_events::SkippedPlatform,
        task_events::TaskWebhookRequest,
        task_events::LogData,
        task_events::StatusData,
        task_events::TaskWebhookReport,
        handlers::webhooks::BuildWebhookResponse,
        handlers::webhooks::TaskWebhookResponse,
    )),
    tags( (name = "ship", description = "CI add-on webhook API") )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route("/webhook", post(build_webhook))
        .route("/task-webhook", post(task_webhook))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        .with_state(state)
}
