use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use serde::Serialize;
use utoipa::ToSchema;
use crate::AppState;
use crate::build_events::{BuildEventType, BuildWebhookPayload, BuildWebhookReport};
use crate::error::{ApiError, ApiResult, PipelineError};
use crate::task_events::{TaskWebhook, TaskWebhookReport};
use crate::telemetry::WEBHOOKS;

pub const EVENT_TYPE_HEADER: &str = "Bitrise-Event-Type";

#[derive(Debug, Serialize, ToSchema)]
pub struct BuildWebhookResponse { pub message: &'static str, pub data: BuildWebhookReport }

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskWebhookResponse { pub message: &'static str, pub data: TaskWebhookReport }

fn record<T>(kind: &str, result: Result<T, PipelineError>) -> ApiResult<T> {
    let outcome = match &result { Ok(_) => "ok", Err(e) => e.code() };
    WEBHOOKS.with_label_values(&[kind, outcome]).inc();
    result.map_err(ApiError::from)
}

fn event_type(headers: &HeaderMap) -> Result<BuildEventType, PipelineError> {
    let raw = headers.get(EVENT_TYPE_HEADER)
        .ok_or_else(|| PipelineError::Payload(format!("missing {EVENT_TYPE_HEADER} header")))?
        .to_str()
        .map_err(|_| PipelineError::Payload(format!("{EVENT_TYPE_HEADER} header is not valid text")))?;
    raw.parse()
}

async fn dispatch_build(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<BuildWebhookReport, PipelineError> {
    let event = event_type(headers)?;
    if event != BuildEventType::Finished {
        tracing::debug!(event=event.as_str(), "build_webhook.acknowledged");
        return Ok(BuildWebhookReport::acknowledged(event));
    }
    let payload: BuildWebhookPayload = serde_json::from_slice(body).map_err(|e| PipelineError::Payload(e.to_string()))?;
    state.build_events.handle_finished(&payload).await
}

/// CI build event webhook
#[utoipa::path(post, path = "/webhook", request_body = BuildWebhookPayload,
    params(("Bitrise-Event-Type" = String, Header, description = "build/triggered, build/started or build/finished")),
    responses(
        (status = 200, body = BuildWebhookResponse, description = "Event processed"),
        (status = 400, body = crate::error::ApiErrorBody, description = "Malformed payload or unknown event type"),
        (status = 404, body = crate::error::ApiErrorBody, description = "Unknown app"),
        (status = 422, body = crate::error::ApiErrorBody, description = "Version rejected by validation"),
        (status = 500, body = crate::error::ApiErrorBody, description = "Upstream, persistence, worker or notification failure")
    ))]
#[tracing::instrument(skip(state, headers, body), fields(bytes = body.len()))]
pub async fn build_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Json<BuildWebhookResponse>> {
    let data = record("build", dispatch_build(&state, &headers, &body).await)?;
    Ok(Json(BuildWebhookResponse { message: "ok", data }))
}

/// Publish task webhook
#[utoipa::path(post, path = "/task-webhook", request_body = crate::task_events::TaskWebhookRequest,
    responses(
        (status = 200, body = TaskWebhookResponse, description = "Chunk buffered or status recorded"),
        (status = 400, body = crate::error::ApiErrorBody, description = "Malformed payload, unknown type or invalid status"),
        (status = 404, body = crate::error::ApiErrorBody, description = "Unknown task"),
        (status = 500, body = crate::error::ApiErrorBody, description = "Persistence or worker failure")
    ))]
#[tracing::instrument(skip(state, body), fields(bytes = body.len()))]
pub async fn task_webhook(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<TaskWebhookResponse>> {
    let result = match TaskWebhook::decode(&body) {
        Ok(hook) => state.task_events.handle(hook).await,
        Err(e) => Err(e),
    };
    let data = record("task", result)?;
    Ok(Json(TaskWebhookResponse { message: "ok", data }))
}
