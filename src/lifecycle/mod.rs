//! Profile lifecycle: the start/stop/restart/status operations behind the
//! CLI. Start brings up tunnel, webhook, gateway, and a detached monitor
//! process in that order; stop tears down in reverse.

use crate::materialize;
use crate::profile::{Profile, ProfileStore};
use crate::registry::{PROFILE_ENV, Registry, Role, STOP_TIMEOUT};
use crate::tunnel::{self, TunnelManager};
use crate::webhook::{RetryPolicy, WebhookClient};
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};

/// Resolve the binary to relaunch for the monitor role. `BOTWAY_BIN`
/// overrides the running executable (packaging setups where the invoked
/// path is a wrapper).
pub fn botway_bin() -> Result<PathBuf> {
    if let Ok(bin) = std::env::var("BOTWAY_BIN") {
        if !bin.is_empty() {
            return Ok(PathBuf::from(bin));
        }
    }
    std::env::current_exe().context("Could not resolve own executable path")
}

// ── Start ──────────────────────────────────────────────────────

/// Bring a profile fully up. Refuses if any role is already running.
pub async fn start_profile(store: &ProfileStore, name: &str) -> Result<()> {
    start_profile_with_api(store, name, crate::webhook::DEFAULT_API_BASE).await
}

/// [`start_profile`] against an explicit Bot API base, so the whole start
/// sequence can run against a mock server.
pub async fn start_profile_with_api(
    store: &ProfileStore,
    name: &str,
    api_base: &str,
) -> Result<()> {
    let profile = store.load(name)?;
    let dir = store.profile_dir(name);
    let registry = Registry::new(&dir);

    for role in Role::ALL {
        if let Some(pid) = registry.alive(role) {
            bail!("Profile '{name}' has a running {role} (PID {pid}); use restart instead");
        }
    }

    // One rotation per start keeps each log scoped to the current run.
    for log_name in ["orchestrator", "gateway", "tunnel"] {
        crate::logs::rotate(&crate::logs::log_path(&dir, log_name))?;
    }

    println!("🚇 Starting tunnel for '{name}'...");
    let manager = TunnelManager::new(&dir, profile.port, profile.tunnel_domain.clone());
    let url = manager.start(&registry).await?;
    println!("   Public address: {url}");

    let config = materialize::materialize(&profile, &url);
    let artifact = materialize::write_artifact(&config, &dir)?;

    println!("🔗 Registering webhook...");
    let webhook = WebhookClient::with_base(profile.token.clone(), api_base.to_string());
    if webhook
        .register_with_retry(&materialize::webhook_url(&url), &RetryPolicy::default())
        .await
    {
        println!("   Webhook set to {}", materialize::webhook_url(&url));
    } else {
        println!("   ⚠️  Webhook registration failed; the monitor will keep retrying");
    }

    println!("🤖 Starting gateway...");
    let gateway_pid =
        match crate::gateway::start(&registry, &profile.gateway_command, profile.port, &artifact)
            .await
        {
            Ok(pid) => pid,
            Err(e) => {
                // Don't leave a half-started profile behind.
                let _ = registry.stop_role(Role::Tunnel, STOP_TIMEOUT);
                let _ = tunnel::clear_url(&dir);
                return Err(anyhow::Error::from(e).context("Gateway failed to start"));
            }
        };

    let monitor_pid = spawn_monitor(&dir, name)?;
    registry.save(Role::Monitor, monitor_pid)?;

    println!("✅ Profile '{name}' is up");
    println!("   gateway PID {gateway_pid}, monitor PID {monitor_pid}");
    Ok(())
}

/// Launch `botway monitor <name>` detached, logging to the orchestrator log.
fn spawn_monitor(profile_dir: &Path, name: &str) -> Result<u32> {
    use std::os::unix::process::CommandExt;

    let log = crate::logs::log_path(profile_dir, "orchestrator");
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .with_context(|| format!("Failed to open {}", log.display()))?;
    let log_file_err = log_file
        .try_clone()
        .context("Failed to clone log file handle")?;

    let bin = botway_bin()?;
    let child = std::process::Command::new(&bin)
        .arg("monitor")
        .arg(name)
        .env(PROFILE_ENV, profile_dir.to_string_lossy().as_ref())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(log_file_err))
        .process_group(0)
        .spawn()
        .with_context(|| format!("Failed to spawn monitor via {}", bin.display()))?;
    Ok(child.id())
}

// ── Stop ───────────────────────────────────────────────────────

/// Tear a profile down. Idempotent: stopping a stopped profile succeeds.
pub async fn stop_profile(store: &ProfileStore, name: &str) -> Result<()> {
    stop_profile_with_api(store, name, crate::webhook::DEFAULT_API_BASE).await
}

/// [`stop_profile`] against an explicit webhook API base.
pub async fn stop_profile_with_api(
    store: &ProfileStore,
    name: &str,
    api_base: &str,
) -> Result<()> {
    let profile = store.load(name)?;
    let dir = store.profile_dir(name);
    let registry = Registry::new(&dir);

    // Deregister first so Telegram stops delivering into a dying gateway.
    println!("🔗 Removing webhook...");
    WebhookClient::with_base(profile.token.clone(), api_base.to_string())
        .remove_best_effort()
        .await;

    // Monitor first, so it cannot observe the teardown as an outage.
    for role in [Role::Monitor, Role::Gateway, Role::Tunnel] {
        if registry.alive(role).is_some() {
            println!("🛑 Stopping {role}...");
        }
        registry.stop_role(role, STOP_TIMEOUT)?;
    }

    tunnel::clear_url(&dir)?;
    println!("✅ Profile '{name}' stopped");
    Ok(())
}

pub async fn restart_profile(store: &ProfileStore, name: &str) -> Result<()> {
    stop_profile(store, name).await?;
    start_profile(store, name).await
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RoleStatus {
    pub role: Role,
    pub pid: Option<u32>,
}

#[derive(Debug)]
pub struct ProfileStatus {
    pub name: String,
    pub port: u16,
    pub port_open: bool,
    pub tunnel_url: Option<String>,
    pub roles: Vec<RoleStatus>,
}

impl ProfileStatus {
    pub fn is_running(&self) -> bool {
        self.roles.iter().any(|r| r.pid.is_some())
    }
}

/// Collect liveness for every role of one profile.
pub fn gather_status(store: &ProfileStore, profile: &Profile) -> ProfileStatus {
    let dir = store.profile_dir(&profile.name);
    let registry = Registry::new(&dir);
    let roles = Role::ALL
        .into_iter()
        .map(|role| RoleStatus {
            role,
            pid: registry.alive(role),
        })
        .collect();
    ProfileStatus {
        name: profile.name.clone(),
        port: profile.port,
        port_open: crate::gateway::is_listening(profile.port),
        tunnel_url: tunnel::current_url(&dir),
        roles,
    }
}

pub fn print_status(status: &ProfileStatus) {
    let marker = if status.is_running() { "🟢" } else { "⚪" };
    let port_note = if status.port_open { "listening" } else { "closed" };
    println!(
        "{marker} {} (port {}, {port_note})",
        status.name, status.port
    );
    for rs in &status.roles {
        match rs.pid {
            Some(pid) => println!("   {:<8} running (PID {pid})", rs.role.as_str()),
            None => println!("   {:<8} stopped", rs.role.as_str()),
        }
    }
    match &status.tunnel_url {
        Some(url) => println!("   address  {url}"),
        None => println!("   address  -"),
    }
}

/// Status for one profile, or all of them.
pub fn status(store: &ProfileStore, name: Option<&str>) -> Result<()> {
    match name {
        Some(name) => {
            let profile = store.load(name)?;
            print_status(&gather_status(store, &profile));
        }
        None => {
            let names = store.names()?;
            if names.is_empty() {
                println!("No profiles yet. Create one with: botway profile create <name>");
                return Ok(());
            }
            for name in names {
                // One unreadable profile must not hide the rest.
                match store.load(&name) {
                    Ok(profile) => print_status(&gather_status(store, &profile)),
                    Err(e) => println!("❌ {name}: {e}"),
                }
            }
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TOKEN: &str = "123456:AAHtestbodytoken";

    #[test]
    fn status_of_fresh_profile_is_all_stopped() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        let profile = store.create("testbot", TOKEN, 18790, None).unwrap();

        let status = gather_status(&store, &profile);
        assert!(!status.is_running());
        assert!(!status.port_open);
        assert_eq!(status.roles.len(), 3);
        assert!(status.roles.iter().all(|r| r.pid.is_none()));
        assert!(status.tunnel_url.is_none());
    }

    #[test]
    fn status_picks_up_persisted_tunnel_url() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        let profile = store.create("testbot", TOKEN, 18790, None).unwrap();
        tunnel::persist_url(&store.profile_dir("testbot"), "https://x.trycloudflare.com").unwrap();

        let status = gather_status(&store, &profile);
        assert_eq!(
            status.tunnel_url.as_deref(),
            Some("https://x.trycloudflare.com")
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_a_stopped_profile() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/deleteWebhook")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true, "result": true
            })))
            .expect(2)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("testbot", TOKEN, 18790, None).unwrap();

        // Nothing running, nothing registered: both calls succeed.
        stop_profile_with_api(&store, "testbot", &server.uri())
            .await
            .unwrap();
        stop_profile_with_api(&store, "testbot", &server.uri())
            .await
            .unwrap();
    }

    #[test]
    fn status_listing_survives_a_corrupt_profile() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("goodbot", TOKEN, 18790, None).unwrap();

        let bad = store.profile_dir("badbot");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(crate::profile::PROFILE_FILE), "port = \"nope\"").unwrap();

        // The corrupt profile is reported inline instead of aborting.
        status(&store, None).unwrap();
    }

    #[tokio::test]
    async fn start_refuses_while_a_role_is_alive() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("testbot", TOKEN, 18790, None).unwrap();
        let dir = store.profile_dir("testbot");
        let registry = Registry::new(&dir);

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .env(PROFILE_ENV, dir.to_string_lossy().as_ref())
            .spawn()
            .unwrap();
        registry.save(Role::Gateway, child.id()).unwrap();

        let err = start_profile(&store, "testbot").await.unwrap_err();
        assert!(err.to_string().contains("use restart instead"), "{err}");

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn botway_bin_prefers_env_override() {
        // Serialized by value: no other test touches BOTWAY_BIN.
        unsafe { std::env::set_var("BOTWAY_BIN", "/opt/botway/bin/botway") };
        assert_eq!(
            botway_bin().unwrap(),
            PathBuf::from("/opt/botway/bin/botway")
        );
        unsafe { std::env::remove_var("BOTWAY_BIN") };
        // Falls back to the current executable.
        assert!(botway_bin().is_ok());
    }
}
