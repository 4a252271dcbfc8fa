use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse { pub status: &'static str, pub service: &'static str, pub version: &'static str }

/// Liveness: answers without touching any dependency.
#[utoipa::path(get, path = "/health", responses( (status = 200, body = HealthResponse) ))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", service: "ship-addon", version: env!("CARGO_PKG_VERSION") })
}
