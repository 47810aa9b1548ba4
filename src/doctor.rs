//! Environment and profile sanity checks behind `botway doctor`.

use crate::profile::{ProfileStore, token_is_valid};
use crate::registry::{Registry, Role};
use anyhow::Result;

fn check(ok: bool, label: &str, detail: &str) -> bool {
    if ok {
        println!("✅ {label}");
    } else {
        println!("❌ {label} — {detail}");
    }
    ok
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file()
    })
}

/// Run every check and report, for one profile or all of them. Exits
/// nonzero through the caller when any check fails.
pub fn run(store: &ProfileStore, name: Option<&str>) -> Result<bool> {
    let mut healthy = true;

    println!("Botway doctor\n");

    healthy &= check(
        binary_on_path("cloudflared"),
        "cloudflared on PATH",
        "install it from https://github.com/cloudflare/cloudflared/releases",
    );

    let mut summaries = store.list()?;
    if let Some(name) = name {
        summaries.retain(|s| s.name == name);
        if summaries.is_empty() {
            anyhow::bail!("No profile named '{name}'");
        }
    }
    if summaries.is_empty() {
        println!("ℹ️  No profiles configured");
        return Ok(healthy);
    }

    for summary in summaries {
        println!("\nProfile '{}':", summary.name);
        let profile = match store.load(&summary.name) {
            Ok(p) => p,
            Err(e) => {
                check(false, "profile record loads", &format!("{e}"));
                healthy = false;
                continue;
            }
        };

        healthy &= check(
            token_is_valid(&profile.token),
            "bot token shape",
            "expected '<digits>:<secret>'",
        );

        let gateway_program = profile
            .gateway_command
            .split_whitespace()
            .next()
            .unwrap_or("");
        let gateway_ok = !gateway_program.is_empty()
            && (gateway_program.contains('/')
                && std::path::Path::new(gateway_program).is_file()
                || binary_on_path(gateway_program));
        healthy &= check(
            gateway_ok,
            &format!("gateway binary '{gateway_program}'"),
            "not found on PATH",
        );

        let registry = Registry::new(&store.profile_dir(&profile.name));
        for role in Role::ALL {
            match registry.alive(role) {
                Some(pid) => println!("ℹ️  {role} running (PID {pid})"),
                None => {
                    // A record for a dead PID means an unclean exit.
                    if let Ok(Some(record)) = registry.get(role) {
                        check(
                            false,
                            &format!("{role} record"),
                            &format!("stale PID {} (process is gone)", record.pid),
                        );
                        healthy = false;
                    }
                }
            }
        }
    }

    Ok(healthy)
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup_finds_common_binaries() {
        // `sh` exists on any unix system this runs on.
        assert!(binary_on_path("sh"));
        assert!(!binary_on_path("definitely-not-a-real-binary-xyz"));
    }
}
