use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;
use crate::models::Platform;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewVersionNotice {
    pub recipients: Vec<String>,
    pub app_slug: String,
    pub app_title: String,
    pub app_icon_url: Option<String>,
    pub app_version_id: Uuid,
    pub platform: Platform,
    pub version: String,
    pub build_number: i64,
    pub public_install_page_url: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send_new_version(&self, notice: &NewVersionNotice) -> anyhow::Result<()>;
}

/// Logs notices instead of sending them; used when no relay is configured.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_new_version(&self, notice: &NewVersionNotice) -> anyhow::Result<()> {
        tracing::info!(app_slug=%notice.app_slug, version=%notice.version, recipients=notice.recipients.len(), "mailer.new_version.logged");
        Ok(())
    }
}

/// Posts notices as JSON to a mail relay, which owns templating and delivery.
#[derive(Debug, Clone)]
pub struct HttpMailer { http: reqwest::Client, url: String }

impl HttpMailer {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { http, url: url.into() })
    }
}

#[derive(Serialize)]
struct RelayMessage<'a> { template: &'static str, notice: &'a NewVersionNotice }

#[async_trait]
impl Mailer for HttpMailer {
    async fn send_new_version(&self, notice: &NewVersionNotice) -> anyhow::Result<()> {
        let resp = self.http.post(&self.url)
            .json(&RelayMessage { template: "new_version", notice })
            .send().await
            .with_context(|| format!("POST {}", self.url))?;
        let status = resp.status();
        if !status.is_success() { anyhow::bail!("mail relay returned {status}"); }
        Ok(())
    }
}

pub fn from_url(url: Option<&str>) -> anyhow::Result<Arc<dyn Mailer>> {
    Ok(match url {
        Some(u) => Arc::new(HttpMailer::new(u)?),
        None => Arc::new(LogMailer),
    })
}
