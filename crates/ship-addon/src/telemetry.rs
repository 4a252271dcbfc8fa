use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, HistogramVec, HistogramOpts, opts};
use once_cell::sync::Lazy;
use axum::{response::IntoResponse, http::StatusCode};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(opts!(name, help), labels).expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("http_requests_total", "HTTP request count", &["method", "path", "status"]));
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(HistogramOpts::new("http_request_duration_seconds", "HTTP request duration seconds"), &["method", "path"]).expect("valid metric definition");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});
pub static WEBHOOKS: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("webhooks_total", "Inbound webhooks by kind and outcome", &["kind", "outcome"]));
pub static APP_VERSIONS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("app_versions_created_total", "App versions created from build events", &["platform"]));
pub static JOBS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("jobs_enqueued_total", "Background jobs accepted by the queue", &["kind"]));
pub static JOBS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("jobs_processed_total", "Background jobs executed", &["kind", "outcome"]));
pub static LOG_CHUNKS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("log_chunks_received_total", "Publish log chunks received").expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static CHUNK_GC_DELETED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("chunk_gc_deleted_total", "Expired chunk store entries purged").expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

const KNOWN_PATHS: &[&str] = &["/webhook", "/task-webhook", "/health", "/readyz", "/metrics", "/openapi.json"];

/// Collapses unrouted paths into one label so scanners cannot inflate series cardinality.
pub fn normalize_path(path: &str) -> &'static str {
    KNOWN_PATHS.iter().copied().find(|p| *p == path).unwrap_or("/other")
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_keeps_routes_and_folds_the_rest() {
        assert_eq!(normalize_path("/task-webhook"), "/task-webhook");
        assert_eq!(normalize_path("/wp-admin/login.php"), "/other");
    }
}
