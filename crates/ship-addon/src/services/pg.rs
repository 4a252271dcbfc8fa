use async_trait::async_trait;
use sqlx::{Pool, Postgres, types::Json};
use uuid::Uuid;
use crate::error::{StoreError, StoreResult};
use crate::models::{App, AppContact, AppSettings, AppVersion, AppVersionEvent, NewAppVersion, NewAppVersionEvent, Platform, PublishTask};
use super::{AppContactService, AppService, AppVersionEventService, AppVersionService, PublishTaskService, Readiness};

const VERSION_COLUMNS: &str = "id, app_id, platform, version, build_number, build_slug, app_info, provisioning_info, store_info, artifact_info, created_at, last_update";
const EVENT_COLUMNS: &str = "id, app_version_id, status, text, created_at";

/// Postgres implementation of every persistence collaborator.
#[derive(Clone, Debug)]
pub struct PgStore { pool: Pool<Postgres> }

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    pub fn pool(&self) -> &Pool<Postgres> { &self.pool }
}

fn unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl AppService for PgStore {
    async fn find_by_slug(&self, app_slug: &str) -> StoreResult<Option<App>> {
        Ok(sqlx::query_as::<_, App>("SELECT id, app_slug, ci_api_token, created_at FROM apps WHERE app_slug = $1")
            .bind(app_slug)
            .fetch_optional(&self.pool).await?)
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<App>> {
        Ok(sqlx::query_as::<_, App>("SELECT id, app_slug, ci_api_token, created_at FROM apps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool).await?)
    }

    async fn settings(&self, app_id: Uuid) -> StoreResult<Option<AppSettings>> {
        Ok(sqlx::query_as::<_, AppSettings>("SELECT app_id, ios_workflow, android_workflow FROM app_settings WHERE app_id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool).await?)
    }
}

#[async_trait]
impl AppVersionService for PgStore {
    async fn create(&self, new: &NewAppVersion) -> StoreResult<AppVersion> {
        let errors = new.validate();
        if !errors.is_empty() { return Err(StoreError::Validation(errors)); }
        let sql = format!("INSERT INTO app_versions (app_id, platform, version, build_number, build_slug, app_info, provisioning_info, store_info, artifact_info, last_update) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) RETURNING {VERSION_COLUMNS}");
        sqlx::query_as::<_, AppVersion>(&sql)
            .bind(new.app_id)
            .bind(new.platform.as_str())
            .bind(&new.version)
            .bind(new.build_number)
            .bind(&new.build_slug)
            .bind(Json(&new.app_info))
            .bind(Json(&new.provisioning_info))
            .bind(&new.store_info)
            .bind(Json(&new.artifact_info))
            .bind(new.last_update)
            .fetch_one(&self.pool).await
            .map_err(|e| {
                if unique_violation(&e) {
                    return StoreError::Validation(vec![format!("build_slug: build {} already has a {} version", new.build_slug, new.platform)]);
                }
                e.into()
            })
    }

    async fn latest(&self, app_id: Uuid, platform: Platform) -> StoreResult<Option<AppVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM app_versions WHERE app_id = $1 AND platform = $2 ORDER BY created_at DESC LIMIT 1");
        Ok(sqlx::query_as::<_, AppVersion>(&sql)
            .bind(app_id)
            .bind(platform.as_str())
            .fetch_optional(&self.pool).await?)
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<AppVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM app_versions WHERE id = $1");
        Ok(sqlx::query_as::<_, AppVersion>(&sql).bind(id).fetch_optional(&self.pool).await?)
    }

    async fn find_by_build(&self, app_id: Uuid, build_slug: &str, platform: Platform) -> StoreResult<Option<AppVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM app_versions WHERE app_id = $1 AND build_slug = $2 AND platform = $3");
        Ok(sqlx::query_as::<_, AppVersion>(&sql)
            .bind(app_id)
            .bind(build_slug)
            .bind(platform.as_str())
            .fetch_optional(&self.pool).await?)
    }
}

#[async_trait]
impl AppVersionEventService for PgStore {
    async fn create(&self, new: &NewAppVersionEvent) -> StoreResult<AppVersionEvent> {
        let errors = new.validate();
        if !errors.is_empty() { return Err(StoreError::Validation(errors)); }
        let sql = format!("INSERT INTO app_version_events (app_version_id, status, text) VALUES ($1,$2,$3) RETURNING {EVENT_COLUMNS}");
        Ok(sqlx::query_as::<_, AppVersionEvent>(&sql)
            .bind(new.app_version_id)
            .bind(new.status.as_str())
            .bind(&new.text)
            .fetch_one(&self.pool).await?)
    }

    async fn list_for_version(&self, app_version_id: Uuid) -> StoreResult<Vec<AppVersionEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM app_version_events WHERE app_version_id = $1 ORDER BY created_at ASC");
        Ok(sqlx::query_as::<_, AppVersionEvent>(&sql).bind(app_version_id).fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl PublishTaskService for PgStore {
    async fn find_by_task_id(&self, task_id: &str) -> StoreResult<Option<PublishTask>> {
        Ok(sqlx::query_as::<_, PublishTask>("SELECT task_id, app_version_id, created_at FROM publish_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool).await?)
    }
}

#[async_trait]
impl AppContactService for PgStore {
    async fn find_all(&self, app: &App) -> StoreResult<Vec<AppContact>> {
        Ok(sqlx::query_as::<_, AppContact>("SELECT id, app_id, email, notify_new_version, confirmed_at FROM app_contacts WHERE app_id = $1 ORDER BY created_at ASC")
            .bind(app.id)
            .fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl Readiness for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
