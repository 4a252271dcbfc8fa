//! Build-finished webhook: resolves the app, applies the per-platform workflow
//! whitelist, and ingests one version per platform that produced a canonical artifact.
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use crate::ci::CiClient;
use crate::error::PipelineError;
use crate::ingest::{BuildRef, VersionIngestor};
use crate::models::{App, ArtifactInfo, Platform};
use crate::notify::NotificationDispatcher;
use crate::selector::{self, SelectedArtifact, Selection};
use crate::services::AppService;

/// CI build status code for a successful build.
pub const BUILD_STATUS_SUCCESS: i32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct BuildWebhookPayload {
    pub app_slug: String,
    pub build_slug: String,
    pub build_number: i64,
    pub build_status: i32,
    #[serde(default)]
    pub build_triggered_workflow: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEventType { Triggered, Started, Finished }

impl FromStr for BuildEventType {
    type Err = PipelineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches("build/") {
            "triggered" => Ok(BuildEventType::Triggered),
            "started" => Ok(BuildEventType::Started),
            "finished" => Ok(BuildEventType::Finished),
            other => Err(PipelineError::InvalidWebhookType(other.to_string())),
        }
    }
}

impl BuildEventType {
    pub fn as_str(&self) -> &'static str {
        match self { BuildEventType::Triggered => "build/triggered", BuildEventType::Started => "build/started", BuildEventType::Finished => "build/finished" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct IngestedVersion {
    pub platform: Platform,
    pub app_version_id: Uuid,
    pub version: String,
    /// False when the build had already been ingested for this platform.
    pub created: bool,
    pub notified: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SkippedPlatform { pub platform: Platform, pub reason: String }

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BuildWebhookReport {
    pub event: String,
    pub ingested: Vec<IngestedVersion>,
    pub skipped: Vec<SkippedPlatform>,
}

impl BuildWebhookReport {
    pub fn acknowledged(event: BuildEventType) -> Self {
        Self { event: event.as_str().to_string(), ingested: Vec::new(), skipped: Vec::new() }
    }

    fn skip(&mut self, platform: Platform, reason: &str) {
        info!(%platform, reason, "build_webhook.platform_skipped");
        self.skipped.push(SkippedPlatform { platform, reason: reason.to_string() });
    }
}

pub struct BuildEventRouter {
    apps: Arc<dyn AppService>,
    ci: Arc<dyn CiClient>,
    ingestor: VersionIngestor,
    dispatcher: NotificationDispatcher,
}

impl BuildEventRouter {
    pub fn new(apps: Arc<dyn AppService>, ci: Arc<dyn CiClient>, ingestor: VersionIngestor, dispatcher: NotificationDispatcher) -> Self {
        Self { apps, ci, ingestor, dispatcher }
    }

    #[tracing::instrument(skip(self, payload), fields(app_slug=%payload.app_slug, build_slug=%payload.build_slug))]
    pub async fn handle_finished(&self, payload: &BuildWebhookPayload) -> Result<BuildWebhookReport, PipelineError> {
        let app = self.apps.find_by_slug(&payload.app_slug).await?
            .ok_or_else(|| PipelineError::NotFound(format!("app {} not found", payload.app_slug)))?;
        let settings = self.apps.settings(app.id).await?
            .ok_or_else(|| PipelineError::NotFound(format!("app settings for {} not found", app.app_slug)))?;
        let mut report = BuildWebhookReport::acknowledged(BuildEventType::Finished);
        if payload.build_status != BUILD_STATUS_SUCCESS {
            for platform in Platform::ALL { report.skip(platform, "build_not_successful"); }
            return Ok(report);
        }
        let mut platforms = Vec::new();
        for platform in Platform::ALL {
            if settings.allows(platform, &payload.build_triggered_workflow) { platforms.push(platform); }
            else { report.skip(platform, "workflow_not_whitelisted"); }
        }
        if platforms.is_empty() { return Ok(report); }

        let outputs = self.ci.get_artifacts(&app.ci_api_token, &app.app_slug, &payload.build_slug).await
            .map_err(PipelineError::Upstream)?;
        let build = BuildRef { slug: &payload.build_slug, number: payload.build_number };
        // A selection error aborts the request even when an earlier platform was
        // ingested; redelivery finds that version through find_by_build.
        for platform in platforms {
            let Some(selection) = selector::select(&outputs, platform)? else {
                report.skip(platform, "no_qualifying_artifact");
                continue;
            };
            let artifact_info = self.resolve_links(&app, &payload.build_slug, &selection).await?;
            let ingested = self.ingestor.ingest(&app, build, &selection, artifact_info).await?;
            let version = ingested.version();
            let notified = self.dispatcher.notify_new_version(&app, version).await?;
            report.ingested.push(IngestedVersion {
                platform,
                app_version_id: version.id,
                version: version.version.clone(),
                created: ingested.is_new(),
                notified,
            });
        }
        Ok(report)
    }

    /// Fetches the install page for the public-install artifact and a download
    /// link for every split APK.
    async fn resolve_links(&self, app: &App, build_slug: &str, selection: &Selection) -> Result<ArtifactInfo, PipelineError> {
        let mut info = ArtifactInfo {
            artifact_slugs: selection.artifact_slugs(),
            publish_enabled: selection.publish_enabled,
            public_install_enabled: selection.public_install_enabled,
            ..ArtifactInfo::default()
        };
        if let Some(slug) = &selection.public_install_slug {
            let links = self.ci.get_artifact_links(&app.ci_api_token, &app.app_slug, build_slug, slug).await
                .map_err(PipelineError::Upstream)?;
            info.public_install_page_url = links.public_install_page_url.filter(|u| !u.trim().is_empty());
            if info.public_install_page_url.is_none() {
                warn!(artifact_slug=%slug, "build_webhook.public_install_url_missing");
            }
        }
        if let SelectedArtifact::SplitApks(apks) = &selection.artifact {
            for apk in apks {
                let links = self.ci.get_artifact_links(&app.ci_api_token, &app.app_slug, build_slug, &apk.slug).await
                    .map_err(PipelineError::Upstream)?;
                let url = links.expiring_download_url.filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| PipelineError::Upstream(anyhow::anyhow!("no download link for split apk {}", apk.title)))?;
                info.download_urls.push(url);
            }
        }
        Ok(info)
    }
}
