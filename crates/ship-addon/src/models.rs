use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};
use crate::build_output::{AppInfo, ProvisioningInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Platform { Ios, Android }

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Ios, Platform::Android];
    pub fn as_str(&self) -> &'static str { match self { Platform::Ios => "ios", Platform::Android => "android" } }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Platform {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s { "ios" => Ok(Platform::Ios), "android" => Ok(Platform::Android), other => Err(format!("unknown platform {other}")) }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct App {
    pub id: Uuid,
    pub app_slug: String,
    #[serde(skip_serializing)]
    pub ci_api_token: String,
    pub created_at: DateTime<Utc>,
}

/// Per-platform workflow whitelists. Each is a comma separated list of CI workflow
/// names; an empty list accepts every workflow and `*` matches anything.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, Default)]
pub struct AppSettings { pub app_id: Uuid, pub ios_workflow: String, pub android_workflow: String }

impl AppSettings {
    pub fn whitelist(&self, platform: Platform) -> &str {
        match platform { Platform::Ios => &self.ios_workflow, Platform::Android => &self.android_workflow }
    }

    pub fn allows(&self, platform: Platform, workflow: &str) -> bool {
        let list = self.whitelist(platform).trim();
        if list.is_empty() { return true; }
        list.split(',').map(str::trim).filter(|w| !w.is_empty()).any(|w| w == "*" || w == workflow)
    }
}

/// Links and capabilities derived from the artifact a version was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    #[serde(default)]
    pub artifact_slugs: Vec<String>,
    #[serde(default)]
    pub publish_enabled: bool,
    #[serde(default)]
    pub public_install_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_install_page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_urls: Vec<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct AppVersion {
    pub id: Uuid,
    pub app_id: Uuid,
    pub platform: String,
    pub version: String,
    pub build_number: i64,
    pub build_slug: String,
    pub app_info: serde_json::Value,
    pub provisioning_info: serde_json::Value,
    pub store_info: serde_json::Value,
    pub artifact_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl AppVersion {
    pub fn platform(&self) -> Option<Platform> { self.platform.parse().ok() }
    pub fn app_info(&self) -> Result<AppInfo, serde_json::Error> { serde_json::from_value(self.app_info.clone()) }
    pub fn provisioning_info(&self) -> Result<ProvisioningInfo, serde_json::Error> { serde_json::from_value(self.provisioning_info.clone()) }
    pub fn artifact_info(&self) -> Result<ArtifactInfo, serde_json::Error> { serde_json::from_value(self.artifact_info.clone()) }
}

#[derive(Debug, Clone)]
pub struct NewAppVersion {
    pub app_id: Uuid,
    pub platform: Platform,
    pub version: String,
    pub build_number: i64,
    pub build_slug: String,
    pub app_info: AppInfo,
    pub provisioning_info: ProvisioningInfo,
    pub store_info: serde_json::Value,
    pub artifact_info: ArtifactInfo,
    pub last_update: DateTime<Utc>,
}

impl NewAppVersion {
    /// Returns every violated rule; an empty list means the record may be persisted.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.version.trim().is_empty() { errors.push("version: must not be empty".to_string()); }
        if self.build_slug.trim().is_empty() { errors.push("build_slug: must not be empty".to_string()); }
        if self.build_number < 0 { errors.push("build_number: must not be negative".to_string()); }
        if !self.store_info.is_object() { errors.push("store_info: must be a JSON object".to_string()); }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus { InProgress, Success, Failed }

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self { EventStatus::InProgress => "in_progress", EventStatus::Success => "success", EventStatus::Failed => "failed" }
    }
}

impl FromStr for EventStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(EventStatus::InProgress),
            "success" => Ok(EventStatus::Success),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status {other}")),
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct AppVersionEvent { pub id: Uuid, pub app_version_id: Uuid, pub status: String, pub text: String, pub created_at: DateTime<Utc> }

impl AppVersionEvent {
    pub fn status(&self) -> Option<EventStatus> { self.status.parse().ok() }
}

#[derive(Debug, Clone)]
pub struct NewAppVersionEvent { pub app_version_id: Uuid, pub status: EventStatus, pub text: String }

impl NewAppVersionEvent {
    pub fn new(app_version_id: Uuid, status: EventStatus, text: impl Into<String>) -> Self {
        Self { app_version_id, status, text: text.into() }
    }

    pub fn validate(&self) -> Vec<String> {
        if self.text.trim().is_empty() { vec!["text: must not be empty".to_string()] } else { Vec::new() }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct PublishTask { pub task_id: String, pub app_version_id: Uuid, pub created_at: DateTime<Utc> }

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct AppContact {
    pub id: Uuid,
    pub app_id: Uuid,
    pub email: String,
    pub notify_new_version: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl AppContact {
    pub fn wants_new_version_mail(&self) -> bool { self.notify_new_version && self.confirmed_at.is_some() }
}
