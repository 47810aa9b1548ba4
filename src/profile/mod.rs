use crate::monitor::MonitorConfig;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Profile record file name within each profile directory.
pub const PROFILE_FILE: &str = "profile.toml";

/// Materialized gateway config artifact file name.
pub const GATEWAY_CONFIG_FILE: &str = "gateway.toml";

/// Named-tunnel config; its presence selects the stable tunnel mode.
pub const NAMED_TUNNEL_FILE: &str = "tunnel.yml";

/// Current public base URL (ephemeral tunnel mode).
pub const TUNNEL_URL_FILE: &str = "tunnel_url";

// ── Typed store errors ─────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile '{0}' already exists")]
    Duplicate(String),
    #[error("Profile name '{0}' is not filesystem-safe (use letters, digits, '-', '_')")]
    InvalidName(String),
    #[error("Bot token has an unexpected shape (expected '<digits>:<secret>')")]
    InvalidToken,
    #[error("Port must be between 1 and 65535")]
    InvalidPort,
    #[error("No profile named '{0}'")]
    NotFound(String),
    #[error("Profile '{name}' is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// ── Data model ─────────────────────────────────────────────────

/// Who may talk to the bot on a given surface (direct messages or groups).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// Accept everyone when true; otherwise only `allowed` identities.
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub allowed: Vec<String>,
}

fn default_gateway_command() -> String {
    "botway-gateway".to_string()
}

/// A named configuration bundle for one bot instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Directory name - computed from the store, not serialized
    #[serde(skip)]
    pub name: String,
    pub display_name: String,
    pub token: String,
    pub port: u16,

    #[serde(default)]
    pub dm_policy: ChannelPolicy,

    #[serde(default)]
    pub group_policy: ChannelPolicy,

    /// Pre-provisioned public domain for the stable tunnel mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_domain: Option<String>,

    /// Command line used to launch the gateway process.
    #[serde(default = "default_gateway_command")]
    pub gateway_command: String,

    /// Overrides the derived internal auth token when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_token: Option<String>,

    /// Opaque pass-through block handed to the gateway unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<toml::Value>,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub name: String,
    pub display_name: String,
    pub port: u16,
}

// ── Validation ─────────────────────────────────────────────────

pub fn name_is_valid(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Coarse shape check only: leading digits, a colon, a non-empty body.
pub fn token_is_valid(token: &str) -> bool {
    match token.split_once(':') {
        Some((id, body)) => {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !body.is_empty()
        }
        None => false,
    }
}

// ── Store ──────────────────────────────────────────────────────

/// Resolve the botway data directory: `$BOTWAY_HOME` or `~/.botway`.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("BOTWAY_HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".botway"))
}

/// Owns all profile records under `<data_dir>/profiles/`.
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn open() -> Result<Self> {
        Ok(Self::at(data_dir()?.join("profiles")))
    }

    /// Store rooted at an explicit directory (tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn profile_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn create(
        &self,
        name: &str,
        token: &str,
        port: u16,
        display_name: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        if !name_is_valid(name) {
            return Err(ProfileError::InvalidName(name.to_string()));
        }
        if !token_is_valid(token) {
            return Err(ProfileError::InvalidToken);
        }
        if port == 0 {
            return Err(ProfileError::InvalidPort);
        }
        let dir = self.profile_dir(name);
        if dir.join(PROFILE_FILE).exists() {
            return Err(ProfileError::Duplicate(name.to_string()));
        }

        let profile = Profile {
            name: name.to_string(),
            display_name: display_name.unwrap_or(name).to_string(),
            token: token.to_string(),
            port,
            dm_policy: ChannelPolicy::default(),
            group_policy: ChannelPolicy::default(),
            tunnel_domain: None,
            gateway_command: default_gateway_command(),
            internal_token: None,
            agent: None,
            monitor: MonitorConfig::default(),
        };
        self.save(&profile)?;
        Ok(profile)
    }

    pub fn load(&self, name: &str) -> Result<Profile, ProfileError> {
        let path = self.profile_dir(name).join(PROFILE_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(name.to_string()));
            }
            Err(e) => {
                return Err(ProfileError::Internal(
                    anyhow::Error::from(e).context(format!("Failed to read {}", path.display())),
                ));
            }
        };
        let mut profile: Profile = toml::from_str(&contents).map_err(|e| ProfileError::Corrupt {
            name: name.to_string(),
            source: e,
        })?;
        profile.name = name.to_string();
        Ok(profile)
    }

    pub fn save(&self, profile: &Profile) -> Result<(), ProfileError> {
        let dir = self.profile_dir(&profile.name);
        fs::create_dir_all(dir.join("pids"))
            .with_context(|| format!("Failed to create {}", dir.display()))
            .map_err(ProfileError::Internal)?;
        fs::create_dir_all(dir.join("logs"))
            .context("Failed to create log directory")
            .map_err(ProfileError::Internal)?;
        let toml_str = toml::to_string_pretty(profile)
            .context("Failed to serialize profile")
            .map_err(ProfileError::Internal)?;
        write_atomic(&dir.join(PROFILE_FILE), toml_str.as_bytes()).map_err(ProfileError::Internal)
    }

    pub fn list(&self) -> Result<Vec<ProfileSummary>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("Failed to list {}", self.root.display())));
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(profile) = self.load(&name) {
                out.push(ProfileSummary {
                    name,
                    display_name: profile.display_name,
                    port: profile.port,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Every directory carrying a profile record, loadable or not. Unlike
    /// [`list`](Self::list), corrupt records are included so callers can
    /// report them instead of pretending they don't exist.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("Failed to list {}", self.root.display())));
            }
        };
        for entry in entries.flatten() {
            if entry.path().join(PROFILE_FILE).is_file() {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn remove(&self, name: &str) -> Result<(), ProfileError> {
        let dir = self.profile_dir(name);
        if !dir.join(PROFILE_FILE).exists() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))
            .map_err(ProfileError::Internal)
    }
}

// ── Atomic file replacement ────────────────────────────────────

/// Write via a uniquely named temp file and rename into place. The PID and
/// tunnel-address files are shared across processes, so readers must never
/// observe a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .context("Target path must have a parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("file");
    let tmp = parent.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        anyhow::bail!("Failed to atomically replace {}: {e}", path.display());
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
    fn token_shape_accepts_digits_colon_body() {
        assert!(token_is_valid("123456:abc-DEF"));
        assert!(!token_is_valid(""));
        assert!(!token_is_valid("nodigits:abc"));
        assert!(!token_is_valid("123456"));
        assert!(!token_is_valid("123456:"));
        assert!(!token_is_valid(":abc"));
    }

    #[test]
    fn name_validation_rejects_path_characters() {
        assert!(name_is_valid("testbot"));
        assert!(name_is_valid("test-bot_2"));
        assert!(!name_is_valid(""));
        assert!(!name_is_valid("a/b"));
        assert!(!name_is_valid("a b"));
        assert!(!name_is_valid("../escape"));
    }

    #[test]
    fn create_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());

        let created = store.create("testbot", TOKEN, 18790, Some("Test Bot")).unwrap();
        assert_eq!(created.port, 18790);

        let loaded = store.load("testbot").unwrap();
        assert_eq!(loaded.name, "testbot");
        assert_eq!(loaded.display_name, "Test Bot");
        assert_eq!(loaded.token, TOKEN);
        assert_eq!(loaded.port, 18790);
        assert_eq!(loaded.gateway_command, "botway-gateway");
        assert!(loaded.tunnel_domain.is_none());
    }

    #[test]
    fn create_rejects_duplicate() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("bot", TOKEN, 8080, None).unwrap();
        match store.create("bot", TOKEN, 8081, None) {
            Err(ProfileError::Duplicate(name)) => assert_eq!(name, "bot"),
            other => panic!("Expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn create_rejects_bad_token_and_port() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        assert!(matches!(
            store.create("bot", "garbage", 8080, None),
            Err(ProfileError::InvalidToken)
        ));
        assert!(matches!(
            store.create("bot", TOKEN, 0, None),
            Err(ProfileError::InvalidPort)
        ));
    }

    #[test]
    fn load_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        assert!(matches!(
            store.load("ghost"),
            Err(ProfileError::NotFound(_))
        ));
    }

    #[test]
    fn load_corrupt_record_is_typed() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        let dir = store.profile_dir("bad");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PROFILE_FILE), "not = [valid").unwrap();
        assert!(matches!(
            store.load("bad"),
            Err(ProfileError::Corrupt { .. })
        ));
    }

    #[test]
    fn list_returns_sorted_summaries() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("zeta", TOKEN, 1001, None).unwrap();
        store.create("alpha", TOKEN, 1002, None).unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn names_includes_profiles_that_fail_to_load() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("goodbot", TOKEN, 1001, None).unwrap();

        let dir = store.profile_dir("badbot");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PROFILE_FILE), "not = [valid").unwrap();

        assert_eq!(store.names().unwrap(), vec!["badbot", "goodbot"]);
        // list() still only yields the loadable one.
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn remove_deletes_profile_dir() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("bot", TOKEN, 8080, None).unwrap();
        store.remove("bot").unwrap();
        assert!(!store.profile_dir("bot").exists());
        assert!(matches!(store.remove("bot"), Err(ProfileError::NotFound(_))));
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::at(tmp.path());
        store.create("bot", TOKEN, 8080, None).unwrap();
        let names: Vec<String> = fs::read_dir(store.profile_dir("bot"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(!names.iter().any(|n| n.contains(".tmp-")), "{names:?}");
    }
}
