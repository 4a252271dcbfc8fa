use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use crate::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReadinessResponse { pub status: &'static str }

/// Readiness probe: pings the backing store.
#[utoipa::path(get, path = "/readyz", responses(
	(status = 200, body = ReadinessResponse, description = "Service ready"),
	(status = 503, body = ReadinessResponse, description = "Dependency not ready")
))]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
	match state.readiness.ping().await {
		Ok(()) => (StatusCode::OK, Json(ReadinessResponse { status: "ready" })),
		Err(e) => {
			tracing::warn!(error=%e, "readiness.degraded");
			(StatusCode::SERVICE_UNAVAILABLE, Json(ReadinessResponse { status: "degraded" }))
		}
	}
}
