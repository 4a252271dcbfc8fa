use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use crate::error::PipelineError;
use crate::models::{App, AppVersion, ArtifactInfo, EventStatus, NewAppVersion, NewAppVersionEvent};
use crate::selector::Selection;
use crate::services::{AppVersionEventService, AppVersionService};
use crate::telemetry::APP_VERSIONS_CREATED;
use crate::worker::WorkerEnqueuer;

pub const VERSION_CREATED_TEXT: &str = "Version created";

/// CI build a version is ingested from.
#[derive(Debug, Clone, Copy)]
pub struct BuildRef<'a> { pub slug: &'a str, pub number: i64 }

#[derive(Debug, Clone)]
pub enum Ingested {
    Created(AppVersion),
    /// The build was already ingested for this platform (webhook redelivery).
    Existing(AppVersion),
}

impl Ingested {
    pub fn version(&self) -> &AppVersion {
        match self { Ingested::Created(v) | Ingested::Existing(v) => v }
    }
    pub fn is_new(&self) -> bool { matches!(self, Ingested::Created(_)) }
}

pub struct VersionIngestor {
    versions: Arc<dyn AppVersionService>,
    events: Arc<dyn AppVersionEventService>,
    worker: Arc<dyn WorkerEnqueuer>,
}

impl VersionIngestor {
    pub fn new(versions: Arc<dyn AppVersionService>, events: Arc<dyn AppVersionEventService>, worker: Arc<dyn WorkerEnqueuer>) -> Self {
        Self { versions, events, worker }
    }

    /// Persists the version described by `selection`, carrying the store listing
    /// of the previous version of the same platform forward.
    #[tracing::instrument(level="debug", skip(self, app, selection, artifact_info), fields(app_slug=%app.app_slug, platform=%selection.platform))]
    pub async fn ingest(&self, app: &App, build: BuildRef<'_>, selection: &Selection, artifact_info: ArtifactInfo) -> Result<Ingested, PipelineError> {
        let platform = selection.platform;
        if let Some(existing) = self.versions.find_by_build(app.id, build.slug, platform).await? {
            info!(app_version_id=%existing.id, build_slug=build.slug, "version.already_ingested");
            return Ok(Ingested::Existing(existing));
        }
        let previous = self.versions.latest(app.id, platform).await?;
        let new = NewAppVersion {
            app_id: app.id,
            platform,
            version: selection.app_info.version.clone().unwrap_or_default(),
            build_number: build.number,
            build_slug: build.slug.to_string(),
            app_info: selection.app_info.clone(),
            provisioning_info: selection.provisioning_info.clone(),
            store_info: previous.as_ref().map(|p| p.store_info.clone()).unwrap_or_else(|| serde_json::json!({})),
            artifact_info,
            last_update: Utc::now(),
        };
        let version = self.versions.create(&new).await?;
        APP_VERSIONS_CREATED.with_label_values(&[platform.as_str()]).inc();
        if let Some(prev) = &previous {
            self.worker.enqueue_copy_uploadables(prev.id, version.id).await.map_err(PipelineError::WorkerEnqueue)?;
        }
        self.events.create(&NewAppVersionEvent::new(version.id, EventStatus::InProgress, VERSION_CREATED_TEXT)).await?;
        info!(app_version_id=%version.id, version=%version.version, carried_from=?previous.map(|p| p.id), "version.created");
        Ok(Ingested::Created(version))
    }
}
