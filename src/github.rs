use crate::model::{Fetch, Release, RemoteRepo};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use tracing::warn;

const GITHUB_API_BASE: &str = "https://api.github.com/";

/// Read-only view of the remote source. Failure is signalled in-band as
/// `Fetch::Unavailable` so callers can tell an outage apart from an account
/// that genuinely has no repositories (or a repo with no releases).
#[async_trait]
pub trait SourceGateway: Send + Sync {
    /// Current repository list for an account, in the order the source
    /// returns it.
    async fn list_repositories(&self, account: &str) -> Fetch<Vec<RemoteRepo>>;

    /// Most recently published release for one repository, if any.
    async fn latest_release(&self, account: &str, repo: &str) -> Fetch<Option<Release>>;
}

#[derive(Clone)]
pub struct GithubClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Self {
        let base_url = Url::parse(GITHUB_API_BASE).expect("valid default GitHub URL");
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: Option<String>, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("gh-watchbot/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn build_request(&self, path: &str) -> Result<reqwest::Request> {
        let endpoint = self.base_url.join(path).context("invalid GitHub base URL")?;
        let mut req = self
            .http
            .get(endpoint)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.build().context("failed to build GitHub request")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.build_request(path)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach GitHub")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("github error {}: {}", status, body));
        }
        res.json().await.context("invalid GitHub response")
    }
}

#[async_trait]
impl SourceGateway for GithubClient {
    async fn list_repositories(&self, account: &str) -> Fetch<Vec<RemoteRepo>> {
        let path = format!("users/{}/repos", account);
        match self.get_json::<Vec<RepoPayload>>(&path).await {
            Ok(payload) => Fetch::Ok(payload.into_iter().map(RemoteRepo::from).collect()),
            Err(err) => {
                warn!(?err, account, "failed to list repositories");
                Fetch::Unavailable
            }
        }
    }

    async fn latest_release(&self, account: &str, repo: &str) -> Fetch<Option<Release>> {
        let path = format!("repos/{}/{}/releases", account, repo);
        match self.get_json::<Vec<ReleasePayload>>(&path).await {
            // The releases endpoint sorts newest-first; the head is the
            // latest published release.
            Ok(payload) => Fetch::Ok(payload.into_iter().next().map(Release::from)),
            Err(err) => {
                warn!(?err, account, repo, "failed to fetch latest release");
                Fetch::Unavailable
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    name: String,
    html_url: String,
}

impl From<RepoPayload> for RemoteRepo {
    fn from(p: RepoPayload) -> Self {
        RemoteRepo {
            name: p.name,
            html_url: p.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReleasePayload {
    id: i64,
    name: Option<String>,
    body: Option<String>,
    html_url: String,
    published_at: Option<DateTime<Utc>>,
}

impl From<ReleasePayload> for Release {
    fn from(p: ReleasePayload) -> Self {
        Release {
            id: p.id.to_string(),
            name: p.name,
            body: p.body,
            html_url: p.html_url,
            published_at: p.published_at,
        }
    }
}
