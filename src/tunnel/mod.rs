use crate::profile::{NAMED_TUNNEL_FILE, TUNNEL_URL_FILE, write_atomic};
use crate::registry::{PROFILE_ENV, Registry, Role};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// The tunnel client binary. Requires `cloudflared` on PATH.
const CLOUDFLARED: &str = "cloudflared";

/// Binary to launch as the tunnel client. `BOTWAY_TUNNEL_BIN` overrides
/// the PATH lookup (tests substitute a stand-in here).
fn tunnel_bin() -> String {
    std::env::var("BOTWAY_TUNNEL_BIN")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| CLOUDFLARED.to_string())
}

/// How long to wait for an ephemeral tunnel to print its public URL.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Log-poll interval while waiting for the URL.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Settle delay for named tunnels before treating the address as ready.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Bounded timeout for the reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Log substrings that indicate tunnel connectivity failures. These often
/// appear well before the public address becomes provably unreachable, so
/// catching them early shortens the outage.
pub const ERROR_MARKERS: [&str; 4] = [
    "serve tunnel error",
    "control stream encountered a failure",
    "connection refused",
    "context deadline exceeded",
];

/// Only the tail of the tunnel log is scanned for recent errors.
const SCAN_TAIL_BYTES: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel did not produce a public URL within {timeout_secs}s (see {log})")]
    AcquisitionTimeout { timeout_secs: u64, log: String },
    #[error("Tunnel process exited before producing a URL (see {log})")]
    ExitedEarly { log: String },
    #[error("Profile has {NAMED_TUNNEL_FILE} but no tunnel_domain configured")]
    MissingDomain,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Outcome of a tunnel-log error scan.
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    pub count: usize,
    pub last: Option<String>,
}

// ── Manager ────────────────────────────────────────────────────

/// Produces a reachable public address for a profile's local port.
pub struct TunnelManager {
    dir: PathBuf,
    port: u16,
    domain: Option<String>,
}

impl TunnelManager {
    pub fn new(profile_dir: &Path, port: u16, domain: Option<String>) -> Self {
        Self {
            dir: profile_dir.to_path_buf(),
            port,
            domain,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        crate::logs::log_path(&self.dir, "tunnel")
    }

    fn named_config(&self) -> PathBuf {
        self.dir.join(NAMED_TUNNEL_FILE)
    }

    /// Start the tunnel process and return its public base URL.
    ///
    /// A named-tunnel config selects the stable mode (pre-known domain,
    /// fixed settle delay). Otherwise an ephemeral tunnel is launched and
    /// its log is polled for the assigned URL, bounded by
    /// [`ACQUIRE_TIMEOUT`]. On success the address is persisted.
    pub async fn start(&self, registry: &Registry) -> Result<String, TunnelError> {
        let named = self.named_config();
        if named.exists() {
            self.start_stable(registry, &named).await
        } else {
            self.start_ephemeral(registry).await
        }
    }

    async fn start_stable(
        &self,
        registry: &Registry,
        named_config: &Path,
    ) -> Result<String, TunnelError> {
        let domain = self.domain.as_deref().ok_or(TunnelError::MissingDomain)?;
        let config_arg = named_config.to_string_lossy().to_string();
        let child = self.spawn(&["tunnel", "--config", &config_arg, "run"])?;
        registry
            .save(Role::Tunnel, child.id())
            .map_err(TunnelError::Internal)?;

        tokio::time::sleep(SETTLE_DELAY).await;

        let url = format!("https://{domain}");
        persist_url(&self.dir, &url).map_err(TunnelError::Internal)?;
        tracing::info!("Tunnel up at {url} (stable)");
        Ok(url)
    }

    /// Launch an ephemeral tunnel regardless of the named-tunnel config. A
    /// recovery restart goes through here directly: the old address is
    /// presumed invalid, so a fresh assigned one is safer than re-settling.
    pub async fn start_ephemeral(&self, registry: &Registry) -> Result<String, TunnelError> {
        let log = self.log_path();
        // Only look at log content appended after this spawn, so a URL from
        // a previous run is never picked up.
        let offset = fs::metadata(&log).map(|m| m.len()).unwrap_or(0);

        let local = format!("http://localhost:{}", self.port);
        let mut child = self.spawn(&["tunnel", "--url", &local])?;
        registry
            .save(Role::Tunnel, child.id())
            .map_err(TunnelError::Internal)?;

        let deadline = tokio::time::Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if let Some(url) = read_appended(&log, offset).as_deref().and_then(discover_url) {
                persist_url(&self.dir, &url).map_err(TunnelError::Internal)?;
                tracing::info!("Tunnel up at {url} (ephemeral)");
                return Ok(url);
            }

            if let Ok(Some(status)) = child.try_wait() {
                let _ = registry.clear(Role::Tunnel);
                tracing::warn!("Tunnel process exited during acquisition: {status}");
                return Err(TunnelError::ExitedEarly {
                    log: log.display().to_string(),
                });
            }

            if tokio::time::Instant::now() >= deadline {
                // Hard failure: release the spawned process before reporting.
                let _ = child.kill();
                let _ = child.wait();
                let _ = registry.clear(Role::Tunnel);
                return Err(TunnelError::AcquisitionTimeout {
                    timeout_secs: ACQUIRE_TIMEOUT.as_secs(),
                    log: log.display().to_string(),
                });
            }
        }
    }

    /// Spawn cloudflared detached, with its log stream redirected to the
    /// per-profile tunnel log file.
    fn spawn(&self, args: &[&str]) -> Result<std::process::Child, TunnelError> {
        use std::os::unix::process::CommandExt;

        let log = self.log_path();
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create log directory")
                .map_err(TunnelError::Internal)?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .with_context(|| format!("Failed to open {}", log.display()))
            .map_err(TunnelError::Internal)?;

        let bin = tunnel_bin();
        std::process::Command::new(&bin)
            .args(args)
            .env(PROFILE_ENV, self.dir.to_string_lossy().as_ref())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::from(log_file))
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to spawn {bin} (is it installed?)"))
            .map_err(TunnelError::Internal)
    }
}

// ── URL discovery and persistence ──────────────────────────────

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").unwrap())
}

/// Find the assigned ephemeral public URL in tunnel log output.
pub fn discover_url(text: &str) -> Option<String> {
    url_pattern().find(text).map(|m| m.as_str().to_string())
}

fn read_appended(path: &Path, offset: u64) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let start = usize::try_from(offset).unwrap_or(0).min(bytes.len());
    Some(String::from_utf8_lossy(&bytes[start..]).to_string())
}

pub fn url_path(profile_dir: &Path) -> PathBuf {
    profile_dir.join(TUNNEL_URL_FILE)
}

pub fn current_url(profile_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(url_path(profile_dir)).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn persist_url(profile_dir: &Path, url: &str) -> Result<()> {
    write_atomic(&url_path(profile_dir), url.as_bytes())
}

/// Remove the persisted address. No error if already absent.
pub fn clear_url(profile_dir: &Path) -> Result<()> {
    match fs::remove_file(url_path(profile_dir)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("Failed to clear tunnel address"),
    }
}

// ── Probes ─────────────────────────────────────────────────────

/// Bounded-timeout liveness probe against the public base address.
///
/// 2xx counts as alive, as does any status in `extra_ok` (default `[405]`:
/// the wrapped gateway rejects unadorned GETs while the tunnel itself is
/// fine). Timeouts and connection errors are unreachable.
pub async fn check_reachable(client: &reqwest::Client, url: &str, extra_ok: &[u16]) -> bool {
    match client.get(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => {
            let status = resp.status();
            status.is_success() || extra_ok.contains(&status.as_u16())
        }
        Err(e) => {
            tracing::debug!("Reachability probe failed for {url}: {e}");
            false
        }
    }
}

/// Tail-parse the tunnel log for known failure lines whose embedded RFC3339
/// timestamp falls within `window` of `now`. Lines without a parsable
/// leading timestamp never count.
pub fn scan_recent_errors(log_path: &Path, window: Duration, now: DateTime<Utc>) -> ErrorReport {
    let Ok(bytes) = fs::read(log_path) else {
        return ErrorReport::default();
    };
    let tail_start = bytes
        .len()
        .saturating_sub(usize::try_from(SCAN_TAIL_BYTES).unwrap_or(usize::MAX));
    let text = String::from_utf8_lossy(&bytes[tail_start..]);

    let mut report = ErrorReport::default();
    for line in text.lines() {
        let Some(ts_token) = line.split_whitespace().next() else {
            continue;
        };
        let Ok(ts) = DateTime::parse_from_rfc3339(ts_token) else {
            continue;
        };
        let age = now.signed_duration_since(ts.with_timezone(&Utc));
        if age < chrono::Duration::zero() || age.to_std().is_ok_and(|d| d > window) {
            continue;
        }
        if ERROR_MARKERS.iter().any(|marker| line.contains(marker)) {
            report.count += 1;
            report.last = Some(line.to_string());
        }
    }
    report
}

// ── Tests ──────────────────────────────────────────────────────
