use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use crate::selector::SelectionError;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String, pub errors: Vec<String> }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), errors: Vec::new() }
    }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, "not_found", msg) }
    pub fn internal(code: &'static str, msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, msg) }
    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, code, msg) }
    pub fn validation(errors: Vec<String>) -> Self {
        Self { errors, ..Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", "validation failed") }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message, errors: self.errors };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Three-way persistence outcome: a store either returns the object, the list of
/// violated rules, or a storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("persistence: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self { StoreError::Persistence(e.into()) }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("invalid webhook type: {0}")]
    InvalidWebhookType(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("{0}")]
    NotFound(String),
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("upstream: {0}")]
    Upstream(#[source] anyhow::Error),
    #[error("persistence: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("worker: {0}")]
    WorkerEnqueue(#[source] anyhow::Error),
    #[error("notification: {0}")]
    Notification(#[source] anyhow::Error),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(errors) => PipelineError::Validation(errors),
            StoreError::Persistence(inner) => PipelineError::Persistence(inner),
        }
    }
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Payload(_) => "bad_request",
            PipelineError::InvalidWebhookType(_) => "invalid_webhook_type",
            PipelineError::InvalidStatus(_) => "invalid_status",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Validation(_) => "validation_failed",
            PipelineError::Selection(SelectionError::MetadataMissing(_)) => "metadata_missing",
            PipelineError::Selection(SelectionError::AppInfoMissing(_)) => "app_info_missing",
            PipelineError::Upstream(_) => "upstream",
            PipelineError::Persistence(_) => "persistence",
            PipelineError::WorkerEnqueue(_) => "worker",
            PipelineError::Notification(_) => "notification",
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let code = e.code();
        match e {
            PipelineError::Payload(_) | PipelineError::InvalidWebhookType(_) | PipelineError::InvalidStatus(_) => ApiError::bad_request(code, e.to_string()),
            PipelineError::NotFound(msg) => ApiError::not_found(msg),
            PipelineError::Validation(errors) => ApiError::validation(errors),
            other => {
                tracing::error!(error=?other, code, "pipeline.failed");
                ApiError::internal(code, format!("{other:#}"))
            }
        }
    }
}
