//! Publish-task lifecycle: `unstarted -> started -> finished(success | failed)`.
//!
//! Each transition appends one event to the version's history. Finishing also
//! schedules assembly of the buffered log chunks into durable storage.
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;
use crate::chunks::ChunkStore;
use crate::error::PipelineError;
use crate::models::{App, AppVersion, AppVersionEvent, EventStatus, NewAppVersionEvent};
use crate::services::AppVersionEventService;
use crate::worker::WorkerEnqueuer;

pub const STARTED_TEXT: &str = "Publishing has started";
pub const SUCCEEDED_TEXT: &str = "Successfully published";
pub const FAILED_TEXT: &str = "Failed to publish";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    Started,
    Finished { exit_code: i32, chunk_count: i64 },
}

impl TaskTransition {
    fn event(&self) -> (EventStatus, &'static str) {
        match self {
            TaskTransition::Started => (EventStatus::InProgress, STARTED_TEXT),
            TaskTransition::Finished { exit_code: 0, .. } => (EventStatus::Success, SUCCEEDED_TEXT),
            TaskTransition::Finished { .. } => (EventStatus::Failed, FAILED_TEXT),
        }
    }
}

/// Durable location of a finished task's log.
pub fn log_path(app_slug: &str, app_version_id: Uuid, event_id: Uuid) -> String {
    format!("logs/{app_slug}/{app_version_id}/{event_id}.log")
}

pub struct TaskStatusTracker {
    events: Arc<dyn AppVersionEventService>,
    chunks: Arc<dyn ChunkStore>,
    worker: Arc<dyn WorkerEnqueuer>,
    chunk_ttl: Duration,
}

impl TaskStatusTracker {
    pub fn new(events: Arc<dyn AppVersionEventService>, chunks: Arc<dyn ChunkStore>, worker: Arc<dyn WorkerEnqueuer>, chunk_ttl: Duration) -> Self {
        Self { events, chunks, worker, chunk_ttl }
    }

    #[tracing::instrument(level="debug", skip(self, app, version), fields(app_version_id=%version.id))]
    pub async fn apply(&self, app: &App, version: &AppVersion, task_id: &str, transition: TaskTransition) -> Result<AppVersionEvent, PipelineError> {
        let (status, text) = transition.event();
        match transition {
            TaskTransition::Started => {
                let event = self.events.create(&NewAppVersionEvent::new(version.id, status, text)).await?;
                self.chunks.init_counter(task_id, self.chunk_ttl).await.map_err(PipelineError::Persistence)?;
                info!(task_id, event_id=%event.id, "publish_task.started");
                Ok(event)
            }
            TaskTransition::Finished { exit_code, chunk_count } => {
                match self.chunks.counter(task_id).await.map_err(PipelineError::Persistence)? {
                    None => warn!(task_id, "publish_task.finished_without_start"),
                    Some(received) if received < chunk_count => info!(task_id, received, chunk_count, "publish_task.chunks_pending"),
                    Some(_) => {}
                }
                let event = self.events.create(&NewAppVersionEvent::new(version.id, status, text)).await?;
                let path = log_path(&app.app_slug, version.id, event.id);
                self.worker.enqueue_store_log(task_id, chunk_count, &path, self.chunk_ttl).await.map_err(PipelineError::WorkerEnqueue)?;
                info!(task_id, exit_code, chunk_count, event_id=%event.id, status=status.as_str(), "publish_task.finished");
                Ok(event)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_decides_terminal_status() {
        assert_eq!(TaskTransition::Finished { exit_code: 0, chunk_count: 1 }.event(), (EventStatus::Success, SUCCEEDED_TEXT));
        assert_eq!(TaskTransition::Finished { exit_code: 137, chunk_count: 1 }.event(), (EventStatus::Failed, FAILED_TEXT));
        assert_eq!(TaskTransition::Started.event().0, EventStatus::InProgress);
    }

    #[test]
    fn log_path_layout() {
        let (v, e) = (Uuid::nil(), Uuid::from_u128(1));
        assert_eq!(log_path("my-app", v, e), format!("logs/my-app/{v}/{e}.log"));
    }
}
