use crate::model::Release;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10/";

/// Discord green, used for release embeds.
const EMBED_COLOR: u32 = 0x2ECC71;

/// Write-side of the chat platform: channel lifecycle plus announcements.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Create a text channel under a category, returning its id.
    async fn create_channel(
        &self,
        guild_id: &str,
        category_id: &str,
        name: &str,
    ) -> Result<String>;

    /// Delete a channel. A channel that is already gone counts as success.
    async fn delete_channel(&self, channel_id: &str) -> Result<()>;

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<()>;

    async fn post_release(&self, channel_id: &str, release: &Release) -> Result<()>;
}

#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for DiscordClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DiscordClient {
    pub fn new(token: String) -> Self {
        let base_url = Url::parse(DISCORD_API_BASE).expect("valid default Discord URL");
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
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

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid Discord base URL")?;
        let mut req = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bot {}", self.token));
        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").json(body);
        }
        req.build().context("failed to build Discord request")
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let request = self.build_request(method, path, body)?;
        debug!(url=%request.url(), "sending discord request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Discord")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from Discord: {}", body));
        }
        Ok(res)
    }

    async fn execute_expecting_success(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let res = self.execute(method, path, body).await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("discord error {}: {}", status, body));
        }
        Ok(res)
    }
}

#[async_trait]
impl ChannelGateway for DiscordClient {
    async fn create_channel(
        &self,
        guild_id: &str,
        category_id: &str,
        name: &str,
    ) -> Result<String> {
        let path = format!("guilds/{}/channels", guild_id);
        let body = build_create_channel_body(category_id, name);
        let res = self
            .execute_expecting_success(Method::POST, &path, Some(&body))
            .await?;
        let payload: CreateChannelResponse =
            res.json().await.context("invalid Discord response")?;
        Ok(payload.id)
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let path = format!("channels/{}", channel_id);
        let res = self.execute(Method::DELETE, &path, None).await?;
        // Already deleted on the platform side; the mirror is converged.
        if res.status() == StatusCode::NOT_FOUND {
            debug!(channel_id, "channel already absent");
            return Ok(());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("discord error {}: {}", status, body));
        }
        Ok(())
    }

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let path = format!("channels/{}/messages", channel_id);
        let body = json!({ "content": text });
        self.execute_expecting_success(Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn post_release(&self, channel_id: &str, release: &Release) -> Result<()> {
        let path = format!("channels/{}/messages", channel_id);
        let body = json!({ "embeds": [build_release_embed(release)] });
        self.execute_expecting_success(Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }
}

pub fn build_create_channel_body(category_id: &str, name: &str) -> Value {
    json!({
        "name": name,
        "type": 0,
        "parent_id": category_id,
    })
}

pub fn build_release_embed(release: &Release) -> Value {
    let title = release.name.as_deref().unwrap_or(&release.id);
    let mut embed = json!({
        "title": format!("📦 New Release: {}", title),
        "description": release.body.as_deref().unwrap_or("No description"),
        "url": release.html_url,
        "color": EMBED_COLOR,
    });
    if let Some(published_at) = &release.published_at {
        embed["footer"] = json!({
            "text": format!("Published at {}", published_at.to_rfc3339()),
        });
    }
    embed
}

#[derive(Deserialize)]
struct CreateChannelResponse {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_release() -> Release {
        Release {
            id: "186".into(),
            name: Some("v1.0.0".into()),
            body: Some("Initial release".into()),
            html_url: "https://github.com/octocat/hello-world/releases/v1.0.0".into(),
            published_at: Some(chrono::Utc.with_ymd_and_hms(2024, 2, 27, 19, 35, 32).unwrap()),
        }
    }

    #[test]
    fn create_channel_body_nests_under_category() {
        let body = build_create_channel_body("cat-1", "hello-world");
        assert_eq!(body["name"], "hello-world");
        assert_eq!(body["type"], 0);
        assert_eq!(body["parent_id"], "cat-1");
    }

    #[test]
    fn release_embed_renders_all_fields() {
        let embed = build_release_embed(&sample_release());
        assert_eq!(embed["title"], "📦 New Release: v1.0.0");
        assert_eq!(embed["description"], "Initial release");
        assert_eq!(
            embed["url"],
            "https://github.com/octocat/hello-world/releases/v1.0.0"
        );
        assert!(embed["footer"]["text"]
            .as_str()
            .unwrap()
            .starts_with("Published at 2024-02-27"));
    }

    #[test]
    fn release_embed_handles_missing_fields() {
        let mut release = sample_release();
        release.name = None;
        release.body = None;
        release.published_at = None;
        let embed = build_release_embed(&release);
        assert_eq!(embed["title"], "📦 New Release: 186");
        assert_eq!(embed["description"], "No description");
        assert!(embed.get("footer").is_none());
    }

    #[test]
    fn build_request_sets_bot_authorization() {
        let client = DiscordClient::new("token".into());
        let body = json!({ "content": "hi" });
        let request = client
            .build_request(Method::POST, "channels/1/messages", Some(&body))
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/api/v10/channels/1/messages");
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()),
            Some("Bot token")
        );
        assert_eq!(
            headers.get("Content-Type").and_then(|h| h.to_str().ok()),
            Some("application/json")
        );
    }
}
