//! Health reconciliation loop: one tick every `tick_secs`, probing the
//! tunnel address, the tunnel log, the gateway process, and (on a stride)
//! the remote webhook registration, with escalating recovery.

use crate::materialize;
use crate::profile::{Profile, ProfileStore};
use crate::registry::{Registry, Role, STOP_TIMEOUT};
use crate::tunnel::{self, TunnelManager};
use crate::webhook::{RetryPolicy, WebhookClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Pause between tearing everything down and bringing it back up, so the
/// tunnel edge drops the old connection before we ask for a new one.
const RESTART_PAUSE: Duration = Duration::from_secs(2);

// ── Configuration ──────────────────────────────────────────────

fn default_tick_secs() -> u64 {
    30
}
fn default_fail_threshold() -> u32 {
    3
}
fn default_log_window_secs() -> u64 {
    60
}
fn default_log_error_threshold() -> usize {
    3
}
fn default_webhook_stride() -> u64 {
    10
}
fn default_probe_ok_statuses() -> Vec<u16> {
    vec![405]
}

/// Per-profile monitor tuning, embedded in the profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between health ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Consecutive failed reachability probes before a full restart.
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    /// How far back the tunnel-log error scan looks, in seconds.
    #[serde(default = "default_log_window_secs")]
    pub log_window_secs: u64,

    /// Recent tunnel-log error lines that trigger a full restart.
    #[serde(default = "default_log_error_threshold")]
    pub log_error_threshold: usize,

    /// The webhook registration is checked every Nth tick. Zero disables
    /// the check entirely.
    #[serde(default = "default_webhook_stride")]
    pub webhook_stride: u64,

    /// Non-2xx statuses the reachability probe still counts as alive.
    #[serde(default = "default_probe_ok_statuses")]
    pub probe_ok_statuses: Vec<u16>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            fail_threshold: default_fail_threshold(),
            log_window_secs: default_log_window_secs(),
            log_error_threshold: default_log_error_threshold(),
            webhook_stride: default_webhook_stride(),
            probe_ok_statuses: default_probe_ok_statuses(),
        }
    }
}

// ── Tick machinery ─────────────────────────────────────────────

/// Mutable state carried across ticks.
#[derive(Debug, Default)]
pub struct MonitorState {
    pub consecutive_failures: u32,
    pub tick: u64,
}

/// Everything one tick observed about the profile.
#[derive(Debug, Clone, Default)]
pub struct TickProbes {
    /// A tunnel PID record exists (alive or not).
    pub tunnel_present: bool,
    pub tunnel_reachable: bool,
    pub recent_log_errors: usize,
    /// A gateway PID record exists (alive or not).
    pub gateway_present: bool,
    pub gateway_alive: bool,
    /// `Some(true)` means the remote registration disagrees with the
    /// expected webhook URL. `None` means the check did not run this tick.
    pub webhook_mismatch: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Unreachable,
    LogErrors,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::Unreachable => write!(f, "public address unreachable"),
            RestartReason::LogErrors => write!(f, "repeated tunnel log errors"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    /// Both role records are gone; the profile was stopped under us.
    Shutdown,
    FullRestart(RestartReason),
    RestartGateway,
    ReconcileWebhook,
}

/// Decide what this tick calls for. Pure: all I/O happens in probe
/// collection and action execution.
///
/// Escalation fires exactly once per threshold crossing; the failure
/// counter resets both on recovery and when the restart is issued.
pub fn evaluate(state: &mut MonitorState, probes: &TickProbes, cfg: &MonitorConfig) -> TickAction {
    if !probes.tunnel_present && !probes.gateway_present {
        return TickAction::Shutdown;
    }

    if probes.tunnel_reachable {
        if state.consecutive_failures > 0 {
            tracing::info!(
                "Tunnel reachable again after {} failed probe(s)",
                state.consecutive_failures
            );
            state.consecutive_failures = 0;
        }
    } else {
        state.consecutive_failures += 1;
        tracing::warn!(
            "Tunnel unreachable ({}/{})",
            state.consecutive_failures,
            cfg.fail_threshold
        );
        if state.consecutive_failures >= cfg.fail_threshold {
            state.consecutive_failures = 0;
            return TickAction::FullRestart(RestartReason::Unreachable);
        }
    }

    if probes.recent_log_errors >= cfg.log_error_threshold {
        return TickAction::FullRestart(RestartReason::LogErrors);
    }

    if probes.tunnel_reachable && !probes.gateway_alive {
        return TickAction::RestartGateway;
    }

    if probes.webhook_mismatch == Some(true) {
        return TickAction::ReconcileWebhook;
    }

    TickAction::Idle
}

// ── Recovery operations ────────────────────────────────────────

/// The side effects a full restart is made of, behind a seam so the
/// sequence itself can be tested without spawning processes.
#[async_trait]
pub trait RestartOps: Sync {
    async fn stop_gateway(&self) -> Result<()>;
    async fn stop_tunnel(&self) -> Result<()>;
    fn clear_address(&self) -> Result<()>;
    /// Bring up a fresh tunnel and return its public base URL.
    async fn start_tunnel(&self) -> Result<String>;
    fn write_gateway_config(&self, tunnel_url: &str) -> Result<()>;
    /// Returns false when registration gave up after retries.
    async fn register_webhook(&self, tunnel_url: &str) -> bool;
    /// Read back the registration; true if it had to be corrected.
    async fn verify_webhook(&self, tunnel_url: &str) -> Result<bool>;
    async fn start_gateway(&self) -> Result<u32>;
}

/// Tear down both roles and rebuild the whole chain in order: tunnel
/// first (the address feeds everything downstream), then the gateway
/// config, the webhook, and finally the gateway itself.
///
/// Teardown is best-effort so a half-dead profile still restarts;
/// bring-up errors propagate and the caller retries on a later tick.
pub async fn full_restart(ops: &dyn RestartOps, reason: RestartReason) -> Result<()> {
    tracing::warn!("Full restart: {reason}");

    if let Err(e) = ops.stop_gateway().await {
        tracing::warn!("Gateway stop during restart failed: {e:#}");
    }
    if let Err(e) = ops.stop_tunnel().await {
        tracing::warn!("Tunnel stop during restart failed: {e:#}");
    }
    if let Err(e) = ops.clear_address() {
        tracing::warn!("Failed to clear stale tunnel address: {e:#}");
    }

    tokio::time::sleep(RESTART_PAUSE).await;

    let url = ops.start_tunnel().await.context("Tunnel relaunch failed")?;
    ops.write_gateway_config(&url)
        .context("Failed to rewrite gateway config")?;

    if !ops.register_webhook(&url).await {
        tracing::warn!("Webhook registration gave up; will be reconciled on a later tick");
    }
    match ops.verify_webhook(&url).await {
        Ok(true) => tracing::info!("Webhook registration corrected after restart"),
        Ok(false) => {}
        Err(e) => tracing::warn!("Webhook verification failed: {e:#}"),
    }

    let pid = ops.start_gateway().await.context("Gateway relaunch failed")?;
    tracing::info!("Full restart complete (gateway PID {pid}, tunnel {url})");
    Ok(())
}

// ── Live implementation ────────────────────────────────────────

struct ProfileOps {
    profile: Profile,
    dir: PathBuf,
    registry: Registry,
    client: reqwest::Client,
    webhook: WebhookClient,
}

impl ProfileOps {
    fn new(profile: Profile, dir: PathBuf) -> Self {
        let registry = Registry::new(&dir);
        let webhook = WebhookClient::new(profile.token.clone());
        Self {
            profile,
            dir,
            registry,
            client: reqwest::Client::new(),
            webhook,
        }
    }

    fn artifact_path(&self) -> PathBuf {
        materialize::artifact_path(&self.dir)
    }

    async fn collect_probes(&self, cfg: &MonitorConfig, tick: u64) -> TickProbes {
        let tunnel_present = self.registry.get(Role::Tunnel).ok().flatten().is_some();
        let gateway_present = self.registry.get(Role::Gateway).ok().flatten().is_some();
        let gateway_alive = self.registry.alive(Role::Gateway).is_some();

        let url = tunnel::current_url(&self.dir);
        let tunnel_reachable = match url.as_deref() {
            Some(u) => tunnel::check_reachable(&self.client, u, &cfg.probe_ok_statuses).await,
            None => false,
        };

        let recent_log_errors = tunnel::scan_recent_errors(
            &crate::logs::log_path(&self.dir, "tunnel"),
            Duration::from_secs(cfg.log_window_secs),
            Utc::now(),
        )
        .count;

        let webhook_mismatch = if tunnel_reachable
            && cfg.webhook_stride > 0
            && tick % cfg.webhook_stride == 0
        {
            match (url.as_deref(), self.webhook.fetch().await) {
                (Some(u), Ok(info)) => Some(info.url != materialize::webhook_url(u)),
                (_, Err(e)) => {
                    tracing::debug!("Webhook check skipped: {e:#}");
                    None
                }
                (None, _) => None,
            }
        } else {
            None
        };

        TickProbes {
            tunnel_present,
            tunnel_reachable,
            recent_log_errors,
            gateway_present,
            gateway_alive,
            webhook_mismatch,
        }
    }
}

#[async_trait]
impl RestartOps for ProfileOps {
    async fn stop_gateway(&self) -> Result<()> {
        crate::gateway::stop(&self.registry)
    }

    async fn stop_tunnel(&self) -> Result<()> {
        self.registry.stop_role(Role::Tunnel, STOP_TIMEOUT)
    }

    fn clear_address(&self) -> Result<()> {
        tunnel::clear_url(&self.dir)
    }

    async fn start_tunnel(&self) -> Result<String> {
        // Fresh log so the next error scan only sees the new process.
        crate::logs::rotate(&crate::logs::log_path(&self.dir, "tunnel"))?;
        let manager = TunnelManager::new(
            &self.dir,
            self.profile.port,
            self.profile.tunnel_domain.clone(),
        );
        Ok(manager.start_ephemeral(&self.registry).await?)
    }

    fn write_gateway_config(&self, tunnel_url: &str) -> Result<()> {
        let config = materialize::materialize(&self.profile, tunnel_url);
        materialize::write_artifact(&config, &self.dir)?;
        Ok(())
    }

    async fn register_webhook(&self, tunnel_url: &str) -> bool {
        self.webhook
            .register_with_retry(&materialize::webhook_url(tunnel_url), &RetryPolicy::default())
            .await
    }

    async fn verify_webhook(&self, tunnel_url: &str) -> Result<bool> {
        self.webhook
            .reconcile(&materialize::webhook_url(tunnel_url))
            .await
    }

    async fn start_gateway(&self) -> Result<u32> {
        Ok(crate::gateway::start(
            &self.registry,
            &self.profile.gateway_command,
            self.profile.port,
            &self.artifact_path(),
        )
        .await?)
    }
}

// ── Loop ───────────────────────────────────────────────────────

/// Run the monitor loop for a profile until it observes a stop.
pub async fn run(store: &ProfileStore, name: &str) -> Result<()> {
    let profile = store.load(name)?;
    let dir = store.profile_dir(name);
    let cfg = profile.monitor.clone();
    let ops = ProfileOps::new(profile, dir);

    tracing::info!(
        "Monitoring profile '{name}' (tick {}s, threshold {})",
        cfg.tick_secs,
        cfg.fail_threshold
    );

    let mut state = MonitorState::default();
    loop {
        tokio::time::sleep(Duration::from_secs(cfg.tick_secs)).await;
        state.tick += 1;

        let probes = ops.collect_probes(&cfg, state.tick).await;
        match evaluate(&mut state, &probes, &cfg) {
            TickAction::Idle => {}
            TickAction::Shutdown => {
                tracing::info!("Both roles stopped; monitor for '{name}' exiting");
                let _ = ops.registry.clear(Role::Monitor);
                return Ok(());
            }
            TickAction::FullRestart(reason) => {
                if let Err(e) = full_restart(&ops, reason).await {
                    tracing::error!("Full restart failed, will retry next tick: {e:#}");
                }
            }
            TickAction::RestartGateway => {
                tracing::warn!("Gateway is down; relaunching");
                if let Err(e) = ops.start_gateway().await {
                    tracing::error!("Gateway relaunch failed: {e:#}");
                }
            }
            TickAction::ReconcileWebhook => {
                if let Some(url) = tunnel::current_url(&ops.dir) {
                    match ops.verify_webhook(&url).await {
                        Ok(true) => tracing::info!("Webhook registration corrected"),
                        Ok(false) => {}
                        Err(e) => tracing::warn!("Webhook reconciliation failed: {e:#}"),
                    }
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
