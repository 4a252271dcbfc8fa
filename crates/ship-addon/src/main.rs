//! Binary entrypoint for the ship add-on service.
use ship_addon::{build_router, AppState, Collaborators};
use ship_addon::chunks::{ChunkStore, PgChunkStore};
use ship_addon::ci::HttpCiClient;
use ship_addon::config::{ServiceConfig, WorkerMode};
use ship_addon::db::init_db;
use ship_addon::logging::init_logging;
use ship_addon::services::PgStore;
use ship_addon::telemetry::{HTTP_REQUESTS, HTTP_REQUEST_DURATION, normalize_path};
use ship_addon::worker::{run_worker, InlineEnqueuer, JobExecutor, PgJobQueue, WorkerEnqueuer};
use ship_addon::{mailer, storage};
use tracing::{info, warn};
use axum::{http::{Request, HeaderValue}, middleware::{self, Next}, response::Response, body::Body};
use tower_http::limit::RequestBodyLimitLayer;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = normalize_path(req.uri().path());
    let start = std::time::Instant::now();
    let mut resp = next.run(req).await;
    let status = resp.status().as_u16().to_string();
    HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label, status.as_str()]).inc();
    HTTP_REQUEST_DURATION.with_label_values(&[method.as_str(), path_label]).observe(start.elapsed().as_secs_f64());
    if let Ok(id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        resp.headers_mut().insert("x-request-id", id);
    }
    resp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServiceConfig::from_env()?;
    init_logging(&cfg.log_level, cfg.log_format)?;
    let pool = init_db(&cfg.database_url, cfg.db_max_connections).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let chunks = Arc::new(PgChunkStore::new(pool.clone()));
    let object_storage = storage::from_config(&cfg.storage).await;
    let executor = JobExecutor::new(chunks.clone(), object_storage);
    let worker: Arc<dyn WorkerEnqueuer> = match cfg.worker.mode {
        WorkerMode::Queue => {
            let queue = PgJobQueue::new(pool.clone(), &cfg.worker);
            tokio::spawn(run_worker(queue.clone(), executor, cfg.worker.poll_interval));
            Arc::new(queue)
        }
        WorkerMode::Inline => {
            warn!("worker.inline_mode");
            Arc::new(InlineEnqueuer::new(executor))
        }
    };
    let gc_store = chunks.clone();
    let gc_interval = cfg.chunk_gc_interval;
    tokio::spawn(async move {
        loop {
            match gc_store.purge_expired().await {
                Ok(n) if n > 0 => info!(deleted=n, "chunk_gc.purged"),
                Ok(_) => {}
                Err(e) => warn!(error=%e, "chunk_gc.failed"),
            }
            tokio::time::sleep(gc_interval).await;
        }
    });

    let state = AppState::new(Collaborators {
        apps: store.clone(),
        versions: store.clone(),
        events: store.clone(),
        tasks: store.clone(),
        contacts: store.clone(),
        readiness: store,
        chunks,
        worker,
        ci: Arc::new(HttpCiClient::new(&cfg.ci_api_url)?),
        mailer: mailer::from_url(cfg.mailer_url.as_deref())?,
        chunk_ttl: cfg.chunk_ttl,
    });

    const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB
    let app = build_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(track_metrics));
    info!(addr=%cfg.addr, "ship-addon listening");
    let listener = tokio::net::TcpListener::bind(cfg.addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await { warn!(error=%e, "ctrl_c handler failed"); }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await; // graceful drain window
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
