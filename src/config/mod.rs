use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_ROLE: &str = "bridge";

// ─── TimingConfig ─────────────────────────────────────────────────────────────

/// Mailbox timing knobs (`[timing]` in config.toml).
///
/// All intervals are deliberately conservative defaults; tune per deployment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Backstop poll of the mailbox directory, in seconds (default: 5).
    /// Covers watch events the OS notification mechanism may drop.
    pub poll_interval_secs: u64,
    /// Delay between read attempts while a newly observed file settles,
    /// in milliseconds (default: 100).
    pub settle_delay_ms: u64,
    /// Read attempts before a newly observed file is given up on (default: 3).
    pub settle_retries: u32,
    /// How long a terminal entry file stays on disk before deletion, in
    /// seconds (default: 30).  Long enough for the producer to observe the
    /// terminal write.
    pub grace_period_secs: u64,
    /// Aggregate status heartbeat interval, in seconds (default: 5).
    pub heartbeat_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            settle_delay_ms: 100,
            settle_retries: 3,
            grace_period_secs: 30,
            heartbeat_interval_secs: 5,
        }
    }
}

// ─── AuthConfig ───────────────────────────────────────────────────────────────

/// Session token configuration (`[auth]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token lifetime in seconds (default: 3600).
    pub token_ttl_secs: u64,
    /// Expired-record sweep interval in seconds (default: 60).
    pub sweep_interval_secs: u64,
    /// When true, every mailbox entry must carry a valid session claim.
    /// When false (default), only entries that claim a session are verified.
    pub require_auth: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            sweep_interval_secs: 60,
            require_auth: false,
        }
    }
}

// ─── BridgeConfig ─────────────────────────────────────────────────────────────

/// Top-level daemon configuration: `config.toml` in the data directory,
/// overridable per-field from CLI/env in `main`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Data directory holding the mailbox, lock, session store, and status
    /// file.  Must be on a tree both sides of the boundary can mount.
    pub data_dir: PathBuf,
    /// Singleton role name for the instance lock (default: "bridge").
    pub role: String,
    /// Log level filter (trace, debug, info, warn, error).
    pub log_level: String,
    /// Optional log file path (rotated daily).
    pub log_file: Option<PathBuf>,
    /// Log format: "pretty" (default) or "json".
    pub log_format: String,
    pub timing: TimingConfig,
    pub auth: AuthConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            role: DEFAULT_ROLE.to_string(),
            log_level: "info".to_string(),
            log_file: None,
            log_format: "pretty".to_string(),
            timing: TimingConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `<data_dir>/config.toml` if present, with the
    /// data dir itself supplied by the caller (CLI/env or default).
    ///
    /// A missing config file is not an error — defaults apply.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let path = data_dir.join("config.toml");

        let mut config = if path.is_file() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config file {}", path.display()))?;
            toml::from_str::<BridgeConfig>(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?
        } else {
            BridgeConfig::default()
        };

        // The CLI-supplied data dir always wins over the file's value.
        config.data_dir = data_dir;
        Ok(config)
    }

    // ── Well-known paths ──────────────────────────────────────────────────────

    /// Directory watched for mailbox entry files.
    pub fn mailbox_dir(&self) -> PathBuf {
        self.data_dir.join("mailbox")
    }

    /// Aggregate status file.  Lives outside the watched mailbox directory.
    pub fn status_file(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }

    /// Session token store shared across the trust boundary.
    pub fn session_store(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// Instance lock file for this config's role.
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join(format!("{}.lock.json", self.role))
    }
}

/// `~/.deskbridge` when a home directory can be determined, else a relative
/// `.deskbridge` in the working directory.
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .map(|home| home.join(".deskbridge"))
        .unwrap_or_else(|| PathBuf::from(".deskbridge"))
}

/// Ensure the data directory layout exists.
pub fn ensure_layout(config: &BridgeConfig) -> Result<()> {
    std::fs::create_dir_all(config.mailbox_dir()).with_context(|| {
        format!(
            "create mailbox directory {}",
            config.mailbox_dir().display()
        )
    })?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = BridgeConfig::default();
        assert_eq!(c.role, "bridge");
        assert_eq!(c.timing.poll_interval_secs, 5);
        assert_eq!(c.auth.token_ttl_secs, 3600);
        assert!(!c.auth.require_auth);
    }

    #[test]
    fn load_reads_toml_and_keeps_cli_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "role = \"viewer\"\n[timing]\ngrace_period_secs = 7\n",
        )
        .unwrap();
        let c = BridgeConfig::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(c.role, "viewer");
        assert_eq!(c.timing.grace_period_secs, 7);
        assert_eq!(c.data_dir, dir.path());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = BridgeConfig::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(c.role, "bridge");
        assert_eq!(c.mailbox_dir(), dir.path().join("mailbox"));
        assert_eq!(c.lock_file(), dir.path().join("bridge.lock.json"));
    }
}
