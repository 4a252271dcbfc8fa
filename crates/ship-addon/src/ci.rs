//! Typed client for the CI vendor API.
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use crate::build_output::BuildOutput;

/// Guards against a vendor that keeps returning a `next` cursor.
const MAX_ARTIFACT_PAGES: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLinks {
    #[serde(default)]
    pub public_install_page_url: Option<String>,
    #[serde(default)]
    pub expiring_download_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
}

#[async_trait]
pub trait CiClient: Send + Sync + 'static {
    async fn get_artifacts(&self, token: &str, app_slug: &str, build_slug: &str) -> anyhow::Result<Vec<BuildOutput>>;
    async fn get_artifact_links(&self, token: &str, app_slug: &str, build_slug: &str, artifact_slug: &str) -> anyhow::Result<ArtifactLinks>;
    async fn get_app_details(&self, token: &str, app_slug: &str) -> anyhow::Result<AppMetadata>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpCiClient { http: reqwest::Client, base_url: String }

impl HttpCiClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("ship-addon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base_url: base_url.into() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &str, url: &str, query: &[(&str, String)]) -> anyhow::Result<T> {
        let resp = self.http.get(url)
            .header(AUTHORIZATION, format!("token {token}"))
            .query(query)
            .send().await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET {url} returned {status}: {}", body.chars().take(200).collect::<String>());
        }
        resp.json::<T>().await.with_context(|| format!("decode GET {url}"))
    }
}

#[async_trait]
impl CiClient for HttpCiClient {
    #[tracing::instrument(level="debug", skip(self, token))]
    async fn get_artifacts(&self, token: &str, app_slug: &str, build_slug: &str) -> anyhow::Result<Vec<BuildOutput>> {
        let url = self.url(&format!("apps/{app_slug}/builds/{build_slug}/artifacts"));
        let mut outputs = Vec::new();
        let mut next: Option<String> = None;
        for _ in 0..MAX_ARTIFACT_PAGES {
            let query: Vec<(&str, String)> = next.take().map(|n| vec![("next", n)]).unwrap_or_default();
            let page: Envelope<Vec<BuildOutput>> = self.get_json(token, &url, &query).await?;
            outputs.extend(page.data);
            match page.paging.and_then(|p| p.next).filter(|n| !n.is_empty()) {
                Some(n) => next = Some(n),
                None => return Ok(outputs),
            }
        }
        tracing::warn!(app_slug, build_slug, pages=MAX_ARTIFACT_PAGES, "ci.artifacts.page_limit_reached");
        Ok(outputs)
    }

    #[tracing::instrument(level="debug", skip(self, token))]
    async fn get_artifact_links(&self, token: &str, app_slug: &str, build_slug: &str, artifact_slug: &str) -> anyhow::Result<ArtifactLinks> {
        let url = self.url(&format!("apps/{app_slug}/builds/{build_slug}/artifacts/{artifact_slug}"));
        let env: Envelope<ArtifactLinks> = self.get_json(token, &url, &[]).await?;
        Ok(env.data)
    }

    #[tracing::instrument(level="debug", skip(self, token))]
    async fn get_app_details(&self, token: &str, app_slug: &str) -> anyhow::Result<AppMetadata> {
        let url = self.url(&format!("apps/{app_slug}"));
        let env: Envelope<AppMetadata> = self.get_json(token, &url, &[]).await?;
        Ok(env.data)
    }
}
