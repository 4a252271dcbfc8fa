//! Persistence collaborators, one narrow trait per resource.
//!
//! Every method returns [`StoreResult`], so callers can tell rule violations
//! (surfaced as a 422 with the list) from storage failures.
pub mod pg;

use async_trait::async_trait;
use uuid::Uuid;
use crate::error::StoreResult;
use crate::models::{App, AppContact, AppSettings, AppVersion, AppVersionEvent, NewAppVersion, NewAppVersionEvent, Platform, PublishTask};

pub use pg::PgStore;

#[async_trait]
pub trait AppService: Send + Sync + 'static {
    async fn find_by_slug(&self, app_slug: &str) -> StoreResult<Option<App>>;
    async fn find(&self, id: Uuid) -> StoreResult<Option<App>>;
    async fn settings(&self, app_id: Uuid) -> StoreResult<Option<AppSettings>>;
}

#[async_trait]
pub trait AppVersionService: Send + Sync + 'static {
    async fn create(&self, new: &NewAppVersion) -> StoreResult<AppVersion>;
    /// Most recently created version of `platform` for the app.
    async fn latest(&self, app_id: Uuid, platform: Platform) -> StoreResult<Option<AppVersion>>;
    async fn find(&self, id: Uuid) -> StoreResult<Option<AppVersion>>;
    async fn find_by_build(&self, app_id: Uuid, build_slug: &str, platform: Platform) -> StoreResult<Option<AppVersion>>;
}

#[async_trait]
pub trait AppVersionEventService: Send + Sync + 'static {
    async fn create(&self, new: &NewAppVersionEvent) -> StoreResult<AppVersionEvent>;
    /// Events of one version, oldest first.
    async fn list_for_version(&self, app_version_id: Uuid) -> StoreResult<Vec<AppVersionEvent>>;
}

#[async_trait]
pub trait PublishTaskService: Send + Sync + 'static {
    async fn find_by_task_id(&self, task_id: &str) -> StoreResult<Option<PublishTask>>;
}

#[async_trait]
pub trait AppContactService: Send + Sync + 'static {
    async fn find_all(&self, app: &App) -> StoreResult<Vec<AppContact>>;
}

#[async_trait]
pub trait Readiness: Send + Sync + 'static {
    async fn ping(&self) -> anyhow::Result<()>;
}
