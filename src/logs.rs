//! Per-profile log files: one per role, rotated once on restart.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll interval for `--follow`.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

pub fn log_path(profile_dir: &Path, name: &str) -> PathBuf {
    profile_dir.join("logs").join(format!("{name}.log"))
}

/// Shift the current log to `<name>.log.1`, replacing any previous rotation.
/// Missing logs rotate to nothing.
pub fn rotate(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut rotated = path.as_os_str().to_os_string();
    rotated.push(".1");
    fs::rename(path, &rotated)
        .with_context(|| format!("Failed to rotate {}", path.display()))?;
    Ok(())
}

/// Last `lines` lines of the file. Missing files read as empty.
pub fn tail(path: &Path, lines: usize) -> Result<String> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    let mut out = all[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Print the tail, then stream appended content until interrupted.
pub async fn follow(path: &Path, lines: usize) -> Result<()> {
    print!("{}", tail(path, lines)?);
    let mut offset = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    loop {
        tokio::time::sleep(FOLLOW_INTERVAL).await;
        let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if len < offset {
            // Rotated underneath us. Start over from the new file.
            offset = 0;
        }
        if len > offset {
            if let Ok(bytes) = fs::read(path) {
                let start = usize::try_from(offset).unwrap_or(0).min(bytes.len());
                print!("{}", String::from_utf8_lossy(&bytes[start..]));
                offset = len;
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
