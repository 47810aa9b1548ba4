use crate::profile::{ChannelPolicy, GATEWAY_CONFIG_FILE, Profile, write_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Fixed callback path segment, constant across all profiles.
pub const WEBHOOK_PATH: &str = "/telegram-webhook";

/// Salt for the derived internal auth token. Changing it rotates every
/// derived token on the next restart.
const TOKEN_SALT: &str = "botway/gateway-token/v1";

/// Runtime configuration handed to the gateway process.
///
/// Generation is pure and deterministic; writing the artifact is a separate
/// step so this can be unit-tested without I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub profile: String,
    pub display_name: String,
    pub port: u16,
    pub bind: String,
    pub webhook_url: String,
    pub internal_token: String,
    pub dm_policy: ChannelPolicy,
    pub group_policy: ChannelPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<toml::Value>,
}

/// Expected webhook URL for a public base address.
pub fn webhook_url(tunnel_url: &str) -> String {
    format!("{}{WEBHOOK_PATH}", tunnel_url.trim_end_matches('/'))
}

/// Internal auth token: overridden value if the profile carries one,
/// otherwise hex SHA-256 of the profile name plus a fixed salt.
fn internal_token(profile: &Profile) -> String {
    if let Some(token) = &profile.internal_token {
        return token.clone();
    }
    let mut hasher = Sha256::new();
    hasher.update(TOKEN_SALT.as_bytes());
    hasher.update(profile.name.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn materialize(profile: &Profile, tunnel_url: &str) -> GatewayConfig {
    GatewayConfig {
        profile: profile.name.clone(),
        display_name: profile.display_name.clone(),
        port: profile.port,
        bind: "127.0.0.1".to_string(),
        webhook_url: webhook_url(tunnel_url),
        internal_token: internal_token(profile),
        dm_policy: profile.dm_policy.clone(),
        group_policy: profile.group_policy.clone(),
        agent: profile.agent.clone(),
    }
}

pub fn render(config: &GatewayConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize gateway config")
}

pub fn artifact_path(profile_dir: &Path) -> PathBuf {
    profile_dir.join(GATEWAY_CONFIG_FILE)
}

/// Write the per-profile artifact the gateway launch receives via `--config`.
pub fn write_artifact(config: &GatewayConfig, profile_dir: &Path) -> Result<PathBuf> {
    let path = artifact_path(profile_dir);
    write_atomic(&path, render(config)?.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileStore;
    use tempfile::TempDir;

    fn test_profile() -> Profile {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store
            .create("testbot", "123456:AAHtesttoken", 18790, None)
            .unwrap()
    }

    #[test]
    fn webhook_url_appends_fixed_segment() {
        assert_eq!(
            webhook_url("https://abc-xyz.example-tunnel.test"),
            "https://abc-xyz.example-tunnel.test/telegram-webhook"
        );
        // Trailing slash never doubles up.
        assert_eq!(
            webhook_url("https://abc-xyz.example-tunnel.test/"),
            "https://abc-xyz.example-tunnel.test/telegram-webhook"
        );
    }

    #[test]
    fn materialize_is_deterministic() {
        let profile = test_profile();
        let a = render(&materialize(&profile, "https://abc.trycloudflare.com")).unwrap();
        let b = render(&materialize(&profile, "https://abc.trycloudflare.com")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn internal_token_is_stable_per_profile() {
        let profile = test_profile();
        let a = materialize(&profile, "https://a.trycloudflare.com");
        let b = materialize(&profile, "https://b.trycloudflare.com");
        // Address changes, derived token does not.
        assert_eq!(a.internal_token, b.internal_token);
        assert_eq!(a.internal_token.len(), 64);
    }

    #[test]
    fn internal_token_override_wins() {
        let mut profile = test_profile();
        profile.internal_token = Some("operator-supplied".into());
        let config = materialize(&profile, "https://a.trycloudflare.com");
        assert_eq!(config.internal_token, "operator-supplied");
    }

    #[test]
    fn artifact_roundtrips_through_toml() {
        let tmp = TempDir::new().unwrap();
        let profile = test_profile();
        let config = materialize(&profile, "https://abc.trycloudflare.com");
        let path = write_artifact(&config, tmp.path()).unwrap();

        let parsed: GatewayConfig =
            toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn agent_settings_pass_through_unchanged() {
        let mut profile = test_profile();
        profile.agent = Some(toml::toml! { model = "small" temperature = 0.3 }.into());
        let config = materialize(&profile, "https://abc.trycloudflare.com");
        let agent = config.agent.unwrap();
        assert_eq!(agent.get("model").and_then(toml::Value::as_str), Some("small"));
    }
}
