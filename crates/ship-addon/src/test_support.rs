//! Test harness utilities for integration & unit tests.
//! In-memory implementations of every collaborator plus fixtures, so router
//! tests run without Postgres, the CI vendor, or a mail relay.
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashMap, sync::{Arc, Mutex, MutexGuard, atomic::{AtomicBool, AtomicUsize, Ordering}}, time::Duration};
use uuid::Uuid;
use crate::build_output::{AppInfo, ArtifactMeta, BuildOutput, ProvisioningInfo};
use crate::chunks::MemoryChunkStore;
use crate::ci::{AppMetadata, ArtifactLinks, CiClient};
use crate::error::{StoreError, StoreResult};
use crate::mailer::{Mailer, NewVersionNotice};
use crate::models::{App, AppContact, AppSettings, AppVersion, AppVersionEvent, NewAppVersion, NewAppVersionEvent, Platform, PublishTask};
use crate::services::{AppContactService, AppService, AppVersionEventService, AppVersionService, PublishTaskService, Readiness};
use crate::storage::MemoryObjectStorage;
use crate::worker::{Job, JobExecutor, WorkerEnqueuer};
use crate::{AppState, Collaborators};

pub const TEST_CHUNK_TTL: Duration = Duration::from_secs(300);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(std::sync::PoisonError::into_inner) }

#[derive(Default)]
struct Tables {
    apps: Vec<App>,
    settings: HashMap<Uuid, AppSettings>,
    versions: Vec<AppVersion>,
    events: Vec<AppVersionEvent>,
    tasks: Vec<PublishTask>,
    contacts: Vec<AppContact>,
}

/// Implements every persistence trait with the same validation and uniqueness rules as `PgStore`.
#[derive(Default)]
pub struct MemoryStore { tables: Mutex<Tables>, unavailable: AtomicBool }

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn set_unavailable(&self, down: bool) { self.unavailable.store(down, Ordering::SeqCst); }

    pub fn add_app(&self, app_slug: &str) -> App {
        let app = App { id: Uuid::new_v4(), app_slug: app_slug.into(), ci_api_token: format!("token-{app_slug}"), created_at: Utc::now() };
        lock(&self.tables).apps.push(app.clone());
        app
    }

    pub fn set_workflows(&self, app_id: Uuid, ios: &str, android: &str) {
        lock(&self.tables).settings.insert(app_id, AppSettings { app_id, ios_workflow: ios.into(), android_workflow: android.into() });
    }

    pub fn add_contact(&self, app_id: Uuid, email: &str, notify_new_version: bool, confirmed: bool) {
        let contact = AppContact { id: Uuid::new_v4(), app_id, email: email.into(), notify_new_version, confirmed_at: confirmed.then(Utc::now) };
        lock(&self.tables).contacts.push(contact);
    }

    pub fn add_task(&self, task_id: &str, app_version_id: Uuid) {
        lock(&self.tables).tasks.push(PublishTask { task_id: task_id.into(), app_version_id, created_at: Utc::now() });
    }

    pub fn versions(&self) -> Vec<AppVersion> { lock(&self.tables).versions.clone() }

    pub fn events(&self) -> Vec<AppVersionEvent> { lock(&self.tables).events.clone() }
}

#[async_trait]
impl AppService for MemoryStore {
    async fn find_by_slug(&self, app_slug: &str) -> StoreResult<Option<App>> {
        Ok(lock(&self.tables).apps.iter().find(|a| a.app_slug == app_slug).cloned())
    }
    async fn find(&self, id: Uuid) -> StoreResult<Option<App>> {
        Ok(lock(&self.tables).apps.iter().find(|a| a.id == id).cloned())
    }
    async fn settings(&self, app_id: Uuid) -> StoreResult<Option<AppSettings>> {
        Ok(lock(&self.tables).settings.get(&app_id).cloned())
    }
}

#[async_trait]
impl AppVersionService for MemoryStore {
    async fn create(&self, new: &NewAppVersion) -> StoreResult<AppVersion> {
        let errors = new.validate();
        if !errors.is_empty() { return Err(StoreError::Validation(errors)); }
        let mut t = lock(&self.tables);
        if t.versions.iter().any(|v| v.app_id == new.app_id && v.build_slug == new.build_slug && v.platform == new.platform.as_str()) {
            return Err(StoreError::Validation(vec![format!("build_slug: build {} already has a {} version", new.build_slug, new.platform)]));
        }
        let encode = |v: serde_json::Result<serde_json::Value>| v.map_err(|e| StoreError::Persistence(e.into()));
        let version = AppVersion {
            id: Uuid::new_v4(),
            app_id: new.app_id,
            platform: new.platform.as_str().into(),
            version: new.version.clone(),
            build_number: new.build_number,
            build_slug: new.build_slug.clone(),
            app_info: encode(serde_json::to_value(&new.app_info))?,
            provisioning_info: encode(serde_json::to_value(&new.provisioning_info))?,
            store_info: new.store_info.clone(),
            artifact_info: encode(serde_json::to_value(&new.artifact_info))?,
            created_at: Utc::now(),
            last_update: new.last_update,
        };
        t.versions.push(version.clone());
        Ok(version)
    }
    async fn latest(&self, app_id: Uuid, platform: Platform) -> StoreResult<Option<AppVersion>> {
        Ok(lock(&self.tables).versions.iter().rev().find(|v| v.app_id == app_id && v.platform == platform.as_str()).cloned())
    }
    async fn find(&self, id: Uuid) -> StoreResult<Option<AppVersion>> {
        Ok(lock(&self.tables).versions.iter().find(|v| v.id == id).cloned())
    }
    async fn find_by_build(&self, app_id: Uuid, build_slug: &str, platform: Platform) -> StoreResult<Option<AppVersion>> {
        Ok(lock(&self.tables).versions.iter().find(|v| v.app_id == app_id && v.build_slug == build_slug && v.platform == platform.as_str()).cloned())
    }
}

#[async_trait]
impl AppVersionEventService for MemoryStore {
    async fn create(&self, new: &NewAppVersionEvent) -> StoreResult<AppVersionEvent> {
        let errors = new.validate();
        if !errors.is_empty() { return Err(StoreError::Validation(errors)); }
        let event = AppVersionEvent { id: Uuid::new_v4(), app_version_id: new.app_version_id, status: new.status.as_str().into(), text: new.text.clone(), created_at: Utc::now() };
        lock(&self.tables).events.push(event.clone());
        Ok(event)
    }
    async fn list_for_version(&self, app_version_id: Uuid) -> StoreResult<Vec<AppVersionEvent>> {
        Ok(lock(&self.tables).events.iter().filter(|e| e.app_version_id == app_version_id).cloned().collect())
    }
}

#[async_trait]
impl PublishTaskService for MemoryStore {
    async fn find_by_task_id(&self, task_id: &str) -> StoreResult<Option<PublishTask>> {
        Ok(lock(&self.tables).tasks.iter().find(|t| t.task_id == task_id).cloned())
    }
}

#[async_trait]
impl AppContactService for MemoryStore {
    async fn find_all(&self, app: &App) -> StoreResult<Vec<AppContact>> {
        Ok(lock(&self.tables).contacts.iter().filter(|c| c.app_id == app.id).cloned().collect())
    }
}

#[async_trait]
impl Readiness for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) { anyhow::bail!("store unavailable"); }
        Ok(())
    }
}

/// CI client serving a fixed artifact list, with per-artifact links.
#[derive(Default)]
pub struct StaticCiClient {
    outputs: Mutex<Vec<BuildOutput>>,
    links: Mutex<HashMap<String, ArtifactLinks>>,
    pub artifact_calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl StaticCiClient {
    pub fn set_outputs(&self, outputs: Vec<BuildOutput>) { *lock(&self.outputs) = outputs; }
    pub fn set_links(&self, artifact_slug: &str, links: ArtifactLinks) { lock(&self.links).insert(artifact_slug.into(), links); }
}

#[async_trait]
impl CiClient for StaticCiClient {
    async fn get_artifacts(&self, _token: &str, _app_slug: &str, _build_slug: &str) -> anyhow::Result<Vec<BuildOutput>> {
        self.artifact_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) { anyhow::bail!("ci api returned 502"); }
        Ok(lock(&self.outputs).clone())
    }
    async fn get_artifact_links(&self, _token: &str, _app_slug: &str, _build_slug: &str, artifact_slug: &str) -> anyhow::Result<ArtifactLinks> {
        Ok(lock(&self.links).get(artifact_slug).cloned().unwrap_or_default())
    }
    async fn get_app_details(&self, _token: &str, app_slug: &str) -> anyhow::Result<AppMetadata> {
        Ok(AppMetadata { title: format!("{app_slug} title"), avatar_url: Some(format!("https://img.example/{app_slug}.png")), project_type: None })
    }
}

#[derive(Default)]
pub struct RecordingMailer { sent: Mutex<Vec<NewVersionNotice>>, pub fail: AtomicBool }

impl RecordingMailer {
    pub fn sent(&self) -> Vec<NewVersionNotice> { lock(&self.sent).clone() }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_new_version(&self, notice: &NewVersionNotice) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) { anyhow::bail!("mail relay unavailable"); }
        lock(&self.sent).push(notice.clone());
        Ok(())
    }
}

/// Records every accepted job and runs it right away when an executor is attached.
pub struct RecordingEnqueuer { jobs: Mutex<Vec<Job>>, executor: Option<JobExecutor>, pub fail: AtomicBool }

impl RecordingEnqueuer {
    pub fn new(executor: Option<JobExecutor>) -> Self { Self { jobs: Mutex::new(Vec::new()), executor, fail: AtomicBool::new(false) } }
    pub fn jobs(&self) -> Vec<Job> { lock(&self.jobs).clone() }
}

#[async_trait]
impl WorkerEnqueuer for RecordingEnqueuer {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) { anyhow::bail!("job queue unavailable"); }
        lock(&self.jobs).push(job.clone());
        if let Some(exec) = &self.executor {
            if let Err(e) = exec.execute(&job).await { tracing::debug!(error=%e, kind=job.kind(), "test_job.failed"); }
        }
        Ok(())
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub chunks: Arc<MemoryChunkStore>,
    pub storage: Arc<MemoryObjectStorage>,
    pub worker: Arc<RecordingEnqueuer>,
    pub ci: Arc<StaticCiClient>,
    pub mailer: Arc<RecordingMailer>,
}

impl Default for TestHarness {
    fn default() -> Self { Self::new() }
}

impl TestHarness {
    pub fn new() -> Self {
        let chunks = Arc::new(MemoryChunkStore::new());
        let storage = Arc::new(MemoryObjectStorage::new());
        let executor = JobExecutor::new(chunks.clone(), storage.clone());
        Self {
            store: Arc::new(MemoryStore::new()),
            chunks,
            storage,
            worker: Arc::new(RecordingEnqueuer::new(Some(executor))),
            ci: Arc::new(StaticCiClient::default()),
            mailer: Arc::new(RecordingMailer::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            apps: self.store.clone(),
            versions: self.store.clone(),
            events: self.store.clone(),
            tasks: self.store.clone(),
            contacts: self.store.clone(),
            readiness: self.store.clone(),
            chunks: self.chunks.clone(),
            worker: self.worker.clone(),
            ci: self.ci.clone(),
            mailer: self.mailer.clone(),
            chunk_ttl: TEST_CHUNK_TTL,
        }
    }

    pub fn state(&self) -> AppState { AppState::new(self.collaborators()) }
}

fn output(title: &str, slug: &str, app_info: AppInfo, distribution: Option<&str>) -> BuildOutput {
    BuildOutput {
        title: title.into(),
        slug: slug.into(),
        metadata: Some(ArtifactMeta {
            app_info,
            provisioning_info: ProvisioningInfo { distribution_type: distribution.map(str::to_string), ..ProvisioningInfo::default() },
            ..ArtifactMeta::default()
        }),
    }
}

pub fn ios_app_info(version: &str, device_families: &[i32]) -> AppInfo {
    AppInfo { app_name: Some("Ship".into()), bundle_id: Some("io.ship.app".into()), version: Some(version.into()), minimum_os: Some("13.0".into()), device_family_list: device_families.to_vec(), ..AppInfo::default() }
}

pub fn android_app_info(version: &str) -> AppInfo {
    AppInfo { app_name: Some("Ship".into()), package_name: Some("io.ship.app".into()), version: Some(version.into()), version_code: Some("7".into()), minimum_sdk_version: Some("21".into()), ..AppInfo::default() }
}

pub fn app_store_ipa(slug: &str, version: &str) -> BuildOutput {
    output("Ship.ipa", slug, ios_app_info(version, &[1, 2]), Some("app-store"))
}

pub fn debug_ipa(slug: &str, version: &str) -> BuildOutput {
    output("Ship-debug.ipa", slug, ios_app_info(version, &[1]), Some("development"))
}

pub fn xcode_archive(slug: &str, version: &str) -> BuildOutput {
    output("Ship.xcarchive.zip", slug, ios_app_info(version, &[1]), None)
}

pub fn app_bundle(slug: &str, version: &str) -> BuildOutput {
    output("app-release.aab", slug, android_app_info(version), None)
}

pub fn split_apk(title: &str, slug: &str, version: &str) -> BuildOutput {
    output(title, slug, android_app_info(version), None)
}
