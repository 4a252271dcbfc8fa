//! Publish-task webhook: `type_id` selects how `data` is decoded.
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;
use crate::chunks::LogChunk;
use crate::error::PipelineError;
use crate::models::EventStatus;
use crate::services::{AppService, AppVersionService, PublishTaskService};
use crate::task_status::{TaskStatusTracker, TaskTransition};
use crate::telemetry::LOG_CHUNKS_RECEIVED;
use crate::worker::WorkerEnqueuer;

/// Wire shape of a task webhook before `data` is decoded.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TaskWebhookRequest {
    /// `log` or `status`.
    pub type_id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub task_id: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
pub struct LogData { pub position: i32, pub chunk: String }

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
pub struct StatusData {
    pub new_status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub generated_log_chunk_count: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl TryFrom<&StatusData> for TaskTransition {
    type Error = PipelineError;
    fn try_from(d: &StatusData) -> Result<Self, Self::Error> {
        match d.new_status.as_str() {
            "started" => Ok(TaskTransition::Started),
            "finished" => {
                let exit_code = d.exit_code.ok_or_else(|| PipelineError::Payload("finished status requires exit_code".into()))?;
                let chunk_count = d.generated_log_chunk_count.ok_or_else(|| PipelineError::Payload("finished status requires generated_log_chunk_count".into()))?;
                if chunk_count < 0 { return Err(PipelineError::Payload("generated_log_chunk_count must not be negative".into())); }
                Ok(TaskTransition::Finished { exit_code, chunk_count })
            }
            other => Err(PipelineError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload { Log(LogData), Status(StatusData) }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWebhook { pub task_id: String, pub timestamp: Option<i64>, pub payload: TaskPayload }

impl TaskWebhook {
    pub fn decode(body: &[u8]) -> Result<Self, PipelineError> {
        let raw: TaskWebhookRequest = serde_json::from_slice(body).map_err(|e| PipelineError::Payload(e.to_string()))?;
        let payload = match raw.type_id.as_str() {
            "log" => TaskPayload::Log(decode_data(raw.data)?),
            "status" => TaskPayload::Status(decode_data(raw.data)?),
            other => return Err(PipelineError::InvalidWebhookType(other.to_string())),
        };
        if raw.task_id.trim().is_empty() { return Err(PipelineError::Payload("task_id must not be empty".into())); }
        Ok(Self { task_id: raw.task_id, timestamp: raw.timestamp, payload })
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, PipelineError> {
    serde_json::from_value(data).map_err(|e| PipelineError::Payload(format!("invalid data: {e}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TaskWebhookReport {
    pub task_id: String,
    /// `log` or `status`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
}

pub struct PublishTaskRouter {
    tasks: Arc<dyn PublishTaskService>,
    versions: Arc<dyn AppVersionService>,
    apps: Arc<dyn AppService>,
    tracker: TaskStatusTracker,
    worker: Arc<dyn WorkerEnqueuer>,
    chunk_ttl: Duration,
}

impl PublishTaskRouter {
    pub fn new(tasks: Arc<dyn PublishTaskService>, versions: Arc<dyn AppVersionService>, apps: Arc<dyn AppService>, tracker: TaskStatusTracker, worker: Arc<dyn WorkerEnqueuer>, chunk_ttl: Duration) -> Self {
        Self { tasks, versions, apps, tracker, worker, chunk_ttl }
    }

    #[tracing::instrument(skip(self, hook), fields(task_id=%hook.task_id))]
    pub async fn handle(&self, hook: TaskWebhook) -> Result<TaskWebhookReport, PipelineError> {
        let transition = match &hook.payload {
            TaskPayload::Status(data) => Some(TaskTransition::try_from(data)?),
            TaskPayload::Log(_) => None,
        };
        let task = self.tasks.find_by_task_id(&hook.task_id).await?
            .ok_or_else(|| PipelineError::NotFound(format!("publish task {} not found", hook.task_id)))?;
        match (hook.payload, transition) {
            (TaskPayload::Log(data), _) => {
                let chunk = LogChunk { task_id: hook.task_id.clone(), position: data.position, content: data.chunk };
                self.worker.enqueue_store_log_chunk(chunk, self.chunk_ttl).await.map_err(PipelineError::WorkerEnqueue)?;
                LOG_CHUNKS_RECEIVED.inc();
                debug!(position=data.position, "publish_task.chunk_accepted");
                Ok(TaskWebhookReport { task_id: hook.task_id, kind: "log".into(), event_id: None, status: None })
            }
            (TaskPayload::Status(_), Some(transition)) => {
                let version = self.versions.find(task.app_version_id).await?
                    .ok_or_else(|| PipelineError::NotFound(format!("app version {} not found", task.app_version_id)))?;
                let app = self.apps.find(version.app_id).await?
                    .ok_or_else(|| PipelineError::NotFound(format!("app {} not found", version.app_id)))?;
                let event = self.tracker.apply(&app, &version, &hook.task_id, transition).await?;
                let status = event.status();
                Ok(TaskWebhookReport { task_id: hook.task_id, kind: "status".into(), event_id: Some(event.id), status })
            }
            (TaskPayload::Status(data), None) => Err(PipelineError::InvalidStatus(data.new_status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(v: serde_json::Value) -> Result<TaskWebhook, PipelineError> {
        TaskWebhook::decode(v.to_string().as_bytes())
    }

    #[test]
    fn decodes_log_and_status_payloads() {
        let log = decode(json!({"type_id":"log","timestamp":1700000000,"task_id":"t1","data":{"position":3,"chunk":"hello"}})).unwrap();
        assert_eq!(log.payload, TaskPayload::Log(LogData { position: 3, chunk: "hello".into() }));
        let status = decode(json!({"type_id":"status","task_id":"t1","data":{"new_status":"finished","exit_code":0,"generated_log_chunk_count":2,"finished_at":1700000100}})).unwrap();
        let TaskPayload::Status(data) = status.payload else { panic!("expected status") };
        assert_eq!(TaskTransition::try_from(&data).unwrap(), TaskTransition::Finished { exit_code: 0, chunk_count: 2 });
    }

    #[test]
    fn unknown_type_and_bad_data_are_client_errors() {
        assert!(matches!(decode(json!({"type_id":"metrics","task_id":"t","data":{}})), Err(PipelineError::InvalidWebhookType(t)) if t == "metrics"));
        assert!(matches!(decode(json!({"type_id":"log","task_id":"t","data":{"position":"first"}})), Err(PipelineError::Payload(_))));
        assert!(matches!(TaskWebhook::decode(b"{not json"), Err(PipelineError::Payload(_))));
        assert!(matches!(decode(json!({"type_id":"log","task_id":" ","data":{"position":1,"chunk":""}})), Err(PipelineError::Payload(_))));
    }

    #[test]
    fn status_transitions() {
        let d = |s: &str| StatusData { new_status: s.into(), exit_code: None, generated_log_chunk_count: None, finished_at: None };
        assert_eq!(TaskTransition::try_from(&d("started")).unwrap(), TaskTransition::Started);
        assert!(matches!(TaskTransition::try_from(&d("unknown")), Err(PipelineError::InvalidStatus(s)) if s == "unknown"));
        assert!(matches!(TaskTransition::try_from(&d("finished")), Err(PipelineError::Payload(_))));
    }
}
