use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment marker every spawned child carries, used to verify that a
/// recorded PID still belongs to this profile before signalling it.
pub const PROFILE_ENV: &str = "BOTWAY_PROFILE";

/// Poll interval while waiting for a signalled process to exit.
const STOP_POLL: Duration = Duration::from_millis(200);

/// Default timeout waiting for graceful shutdown before SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

// ── Roles ──────────────────────────────────────────────────────

/// The three process roles supervised per profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Tunnel,
    Gateway,
    Monitor,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Tunnel, Role::Gateway, Role::Monitor];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Tunnel => "tunnel",
            Role::Gateway => "gateway",
            Role::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Persists process records per (profile, role) so state survives
/// orchestrator restarts. A record is evidence of a launch, never of
/// liveness: callers must re-query the OS process table.
pub struct Registry {
    profile_dir: PathBuf,
}

impl Registry {
    pub fn new(profile_dir: &Path) -> Self {
        Self {
            profile_dir: profile_dir.to_path_buf(),
        }
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    fn record_path(&self, role: Role) -> PathBuf {
        self.profile_dir.join("pids").join(format!("{role}.json"))
    }

    pub fn save(&self, role: Role, pid: u32) -> Result<()> {
        let record = ProcessRecord {
            pid,
            started_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record).context("Failed to serialize record")?;
        crate::profile::write_atomic(&self.record_path(role), &json)
    }

    pub fn get(&self, role: Role) -> Result<Option<ProcessRecord>> {
        let path = self.record_path(role);
        match fs::read(&path) {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Invalid record in {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Remove the record. No error if already absent.
    pub fn clear(&self, role: Role) -> Result<()> {
        let path = self.record_path(role);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// PID of the role's process if it is recorded, alive, and ours.
    pub fn alive(&self, role: Role) -> Option<u32> {
        let record = self.get(role).ok().flatten()?;
        if is_pid_alive(record.pid) && verify_pid_ownership(record.pid, &self.profile_dir) {
            Some(record.pid)
        } else {
            None
        }
    }

    /// Stop the role's process if running, then clear the record.
    /// Stopping an already-stopped role is a no-op success.
    pub fn stop_role(&self, role: Role, timeout: Duration) -> Result<()> {
        if let Some(record) = self.get(role)? {
            if is_pid_alive(record.pid) {
                if verify_pid_ownership(record.pid, &self.profile_dir) {
                    stop_gracefully(record.pid, timeout)?;
                } else {
                    tracing::warn!(
                        "PID {} recorded for role '{role}' is alive but not ours; leaving it",
                        record.pid
                    );
                }
            } else {
                tracing::debug!("Role '{role}' PID {} already dead", record.pid);
            }
        }
        self.clear(role)
    }
}

// ── OS process checks ──────────────────────────────────────────

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`. EPERM means "process exists, but you can't signal
/// it", which still counts as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return errno == libc::EPERM;
    }
    // A zombie still answers signal 0, but the process is already gone.
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat is "pid (comm) state ..."; comm may contain spaces
    // and parentheses, so the state field is found after the last ')'.
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rsplit_once(')')
        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

/// Verify the process with this PID carries `BOTWAY_PROFILE` pointing at the
/// expected profile directory. Only trusts `/proc/<pid>/environ`; if environ
/// is unreadable the answer is false and we refuse to signal. A recycled PID
/// that independently carries the marker would be accepted, which is the
/// documented residual risk.
pub fn verify_pid_ownership(pid: u32, expected_profile_dir: &Path) -> bool {
    let environ_path = format!("/proc/{pid}/environ");
    let Ok(data) = fs::read(&environ_path) else {
        return false;
    };
    let expected = format!("{PROFILE_ENV}={}", expected_profile_dir.to_string_lossy());
    data.split(|&b| b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .any(|s| s == expected)
}

/// Request cooperative termination (SIGTERM), poll until exit or timeout,
/// then force-terminate (SIGKILL). Idempotent for dead PIDs.
pub fn stop_gracefully(pid: u32, timeout: Duration) -> Result<()> {
    if !is_pid_alive(pid) {
        return Ok(());
    }

    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: exited between the liveness check and the signal.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        anyhow::bail!("Failed to send SIGTERM to PID {pid}: {err}");
    }

    let deadline = std::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            tracing::warn!("PID {pid} did not exit within {timeout:?}, sending SIGKILL");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            std::thread::sleep(Duration::from_millis(500));
            if is_pid_alive(pid) {
                anyhow::bail!("PID {pid} survived SIGKILL; process may be uninterruptible");
            }
            return Ok(());
        }
        std::thread::sleep(STOP_POLL);
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    #[test]
    fn save_get_clear_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());

        assert!(registry.get(Role::Tunnel).unwrap().is_none());
        registry.save(Role::Tunnel, 4242).unwrap();
        let record = registry.get(Role::Tunnel).unwrap().unwrap();
        assert_eq!(record.pid, 4242);

        registry.clear(Role::Tunnel).unwrap();
        assert!(registry.get(Role::Tunnel).unwrap().is_none());
        // Clearing again is a no-op.
        registry.clear(Role::Tunnel).unwrap();
    }

    #[test]
    fn records_are_per_role() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());
        registry.save(Role::Tunnel, 1).unwrap();
        registry.save(Role::Gateway, 2).unwrap();
        assert_eq!(registry.get(Role::Tunnel).unwrap().unwrap().pid, 1);
        assert_eq!(registry.get(Role::Gateway).unwrap().unwrap().pid, 2);
        assert!(registry.get(Role::Monitor).unwrap().is_none());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn dead_pid_is_not_alive() {
        let mut child = Command::new("true")
            .stdout(Stdio::null())
            .spawn()
            .expect("true should spawn");
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_pid_alive(pid));
    }

    #[test]
    fn stop_gracefully_dead_pid_is_noop() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        stop_gracefully(pid, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn stop_gracefully_terminates_sleeper() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("sleep should spawn");
        let pid = child.id();
        assert!(is_pid_alive(pid));
        stop_gracefully(pid, Duration::from_secs(5)).unwrap();
        // Reap the zombie so the liveness check sees a truly gone process.
        let _ = child.wait();
        assert!(!is_pid_alive(pid));
    }

    #[test]
    fn alive_requires_ownership_marker() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());
        // Our own PID is alive but does not carry the profile marker.
        registry.save(Role::Gateway, std::process::id()).unwrap();
        assert!(registry.alive(Role::Gateway).is_none());
    }

    #[test]
    fn alive_accepts_owned_child() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());
        let mut child = Command::new("sleep")
            .arg("30")
            .env(PROFILE_ENV, tmp.path().to_string_lossy().as_ref())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        registry.save(Role::Tunnel, child.id()).unwrap();
        assert_eq!(registry.alive(Role::Tunnel), Some(child.id()));

        registry.stop_role(Role::Tunnel, Duration::from_secs(5)).unwrap();
        let _ = child.wait();
        assert!(registry.alive(Role::Tunnel).is_none());
        // Idempotent: stopping a stopped role succeeds.
        registry.stop_role(Role::Tunnel, Duration::from_secs(1)).unwrap();
    }
}
