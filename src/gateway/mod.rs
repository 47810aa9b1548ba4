use crate::registry::{PROFILE_ENV, Registry, Role, STOP_TIMEOUT};
use anyhow::Context;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::path::Path;
use std::time::Duration;

/// A gateway that exits inside this window after launch is an immediate
/// failure, not a transient start.
pub const START_GRACE: Duration = Duration::from_secs(2);

/// Poll interval for exit detection inside the grace window.
const GRACE_POLL: Duration = Duration::from_millis(100);

/// Bound for the port-listening probe.
const LISTEN_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway is already running (PID {0}); stop it or request a restart")]
    AlreadyRunning(u32),
    #[error("Gateway exited immediately after launch ({status}); check {log}")]
    ExitedImmediately { status: String, log: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Start the gateway process from its materialized config artifact.
///
/// `command` is the profile's launch line (program plus leading args);
/// botway appends the port, bind scope, and config path. Output goes to the
/// per-profile gateway log and the child is detached from our process group.
pub async fn start(
    registry: &Registry,
    command: &str,
    port: u16,
    config_path: &Path,
) -> Result<u32, GatewayError> {
    use std::os::unix::process::CommandExt;

    if let Some(pid) = registry.alive(Role::Gateway) {
        return Err(GatewayError::AlreadyRunning(pid));
    }
    // Stale record from a dead process: clean before relaunch.
    registry.clear(Role::Gateway).map_err(GatewayError::Internal)?;

    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .context("Gateway command is empty")
        .map_err(GatewayError::Internal)?;

    let dir = registry.profile_dir();
    let log = crate::logs::log_path(dir, "gateway");
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent)
            .context("Failed to create log directory")
            .map_err(GatewayError::Internal)?;
    }
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .with_context(|| format!("Failed to open {}", log.display()))
        .map_err(GatewayError::Internal)?;
    let log_file_err = log_file
        .try_clone()
        .context("Failed to clone log file handle")
        .map_err(GatewayError::Internal)?;

    let mut child = std::process::Command::new(program)
        .args(parts)
        .arg("--port")
        .arg(port.to_string())
        .arg("--bind")
        .arg("127.0.0.1")
        .arg("--config")
        .arg(config_path)
        .env(PROFILE_ENV, dir.to_string_lossy().as_ref())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(log_file_err))
        .process_group(0)
        .spawn()
        .with_context(|| format!("Failed to spawn gateway '{program}'"))
        .map_err(GatewayError::Internal)?;

    let pid = child.id();

    // Catch immediate crashes (port conflict, bad config, missing binary
    // deps) without parking a runtime worker for the whole grace window.
    let deadline = tokio::time::Instant::now() + START_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(GatewayError::ExitedImmediately {
                    status: status.to_string(),
                    log: log.display().to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GatewayError::Internal(
                    anyhow::Error::from(e).context("Failed to check gateway status after spawn"),
                ));
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(GRACE_POLL).await;
    }

    if let Err(e) = registry.save(Role::Gateway, pid) {
        // Don't leave an untracked orphan behind.
        let _ = child.kill();
        let _ = child.wait();
        return Err(GatewayError::Internal(
            e.context("Failed to record gateway PID; killed spawned gateway"),
        ));
    }

    tracing::info!("Gateway started (PID {pid}, port {port})");
    Ok(pid)
}

/// Stop the gateway if running. Idempotent.
pub fn stop(registry: &Registry) -> anyhow::Result<()> {
    registry.stop_role(Role::Gateway, STOP_TIMEOUT)
}

/// OS-level check that something is accepting connections on the port.
pub fn is_listening(port: u16) -> bool {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    TcpStream::connect_timeout(&addr.into(), LISTEN_PROBE_TIMEOUT).is_ok()
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn is_listening_detects_bound_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_listening(port));
        drop(listener);
        assert!(!is_listening(port));
    }

    #[tokio::test]
    async fn immediate_exit_is_a_distinct_failure() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());
        let config = tmp.path().join("gateway.toml");
        std::fs::write(&config, "").unwrap();

        // `true` ignores the appended args and exits at once.
        match start(&registry, "true", 18790, &config).await {
            Err(GatewayError::ExitedImmediately { .. }) => {}
            other => panic!("Expected ExitedImmediately, got {other:?}"),
        }
        // No record is left behind for the failed start.
        assert!(registry.get(Role::Gateway).unwrap().is_none());
    }

    #[tokio::test]
    async fn start_refuses_while_running_and_stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());
        let config = tmp.path().join("gateway.toml");
        std::fs::write(&config, "").unwrap();

        // A script that ignores the appended args stands in for the gateway.
        let fake = tmp.path().join("fake-gateway.sh");
        std::fs::write(&fake, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let command = fake.to_string_lossy().to_string();

        let pid = start(&registry, &command, 18790, &config).await.unwrap();
        assert_eq!(registry.alive(Role::Gateway), Some(pid));

        match start(&registry, &command, 18790, &config).await {
            Err(GatewayError::AlreadyRunning(p)) => assert_eq!(p, pid),
            other => panic!("Expected AlreadyRunning, got {other:?}"),
        }

        stop(&registry).unwrap();
        assert!(registry.alive(Role::Gateway).is_none());
        stop(&registry).unwrap();
    }

    #[tokio::test]
    async fn empty_command_errors_cleanly() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path());
        let config = tmp.path().join("gateway.toml");
        std::fs::write(&config, "").unwrap();
        assert!(start(&registry, "   ", 18790, &config).await.is_err());
    }
}
