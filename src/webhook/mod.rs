use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Per-request HTTP timeout against the webhook registry.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Backoff schedule for webhook registration. A freshly created public
/// address can take a while to propagate, so registration absorbs that
/// delay instead of failing the start sequence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Remote webhook state, mirrored locally only for comparison.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub last_error_message: Option<String>,
    /// Epoch seconds of the platform's last delivery failure.
    #[serde(default)]
    pub last_error_date: Option<i64>,
    #[serde(default)]
    pub pending_update_count: u32,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
}

/// Bot-token-scoped client for the remote webhook registry.
pub struct WebhookClient {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(token: String) -> Self {
        Self::with_base(token, DEFAULT_API_BASE.to_string())
    }

    /// Point at a different API base (tests).
    pub fn with_base(token: String, api_base: String) -> Self {
        Self {
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    async fn call(&self, method: &str, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut request = self.client.post(self.api_url(method));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let envelope: ApiEnvelope = request
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} returned an unparsable response"))?;

        if !envelope.ok {
            bail!(
                "{method} rejected: {}",
                envelope.description.unwrap_or_else(|| "no description".into())
            );
        }
        Ok(envelope.result)
    }

    /// Register `url` as the platform's callback. Single attempt.
    pub async fn register(&self, url: &str) -> Result<()> {
        self.call("setWebhook", Some(serde_json::json!({ "url": url })))
            .await?;
        Ok(())
    }

    /// Register with capped exponential backoff. Exhausting retries is
    /// reported as `false`, not an error: the health monitor retries later.
    pub async fn register_with_retry(&self, url: &str, policy: &RetryPolicy) -> bool {
        let mut delay = policy.base;
        for attempt in 1..=policy.max_attempts.max(1) {
            match self.register(url).await {
                Ok(()) => {
                    tracing::info!("Webhook registered: {url}");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Webhook registration attempt {attempt}/{} failed: {e}",
                        policy.max_attempts
                    );
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.cap);
            }
        }
        tracing::warn!("Webhook registration retries exhausted for {url}");
        false
    }

    pub async fn fetch(&self) -> Result<WebhookInfo> {
        let result = self.call("getWebhookInfo", None).await?;
        serde_json::from_value(result).context("getWebhookInfo returned an unexpected shape")
    }

    pub async fn remove(&self) -> Result<()> {
        self.call("deleteWebhook", None).await?;
        Ok(())
    }

    /// Best-effort removal before shutdown, so the platform stops queuing
    /// messages against a bot that is about to go offline.
    pub async fn remove_best_effort(&self) {
        if let Err(e) = self.remove().await {
            tracing::warn!("Webhook removal failed (continuing shutdown): {e}");
        }
    }

    /// Compare the remote registration against `expected` and re-register on
    /// mismatch. Returns whether a re-registration was issued.
    pub async fn reconcile(&self, expected: &str) -> Result<bool> {
        let info = self.fetch().await?;
        if info.url == expected {
            return Ok(false);
        }
        tracing::warn!(
            "Webhook drift: registered '{}', expected '{expected}'; re-registering",
            info.url
        );
        self.register(expected).await?;
        Ok(true)
    }
}

// ── Tests ──────────────────────────────────────────────────────
