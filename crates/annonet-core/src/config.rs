//! Configuration system for Annonet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ANNONET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/annonet/config.toml
//!   3. ~/.config/annonet/config.toml

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::DEFAULT_MAX_PAYLOAD;

/// Port used for both the TCP server and UDP announcements unless overridden.
pub const DEFAULT_PORT: u16 = 11338;

/// Default announce text. Acts as a namespace filter between unrelated groups.
pub const DEFAULT_ANNOUNCE_TEXT: &str = "TTD";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnonetConfig {
    pub discovery: DiscoveryConfig,
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Shared filter string carried in every announcement.
    pub announce_text: String,
    /// UDP port announcements are sent to and listened on.
    pub discovery_port: u16,
    /// Connect to the first matching server as soon as it is discovered.
    pub auto_connect: bool,
    /// Name shown to clients. Empty = host name.
    pub server_name: String,
    /// Delay before the first announcement after the server starts.
    pub announce_delay_ms: u64,
    /// Interval between announcements.
    pub announce_interval_ms: u64,
    /// Explicit destinations for announcements. Empty = broadcast address of
    /// every up, non-loopback IPv4 interface.
    pub announce_addresses: Vec<Ipv4Addr>,
    /// Forget sessions not re-announced within this many seconds. 0 = never.
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port the server listens on. 0 = OS-assigned.
    pub port: u16,
    /// Give up on a connection attempt after this many seconds.
    pub connect_timeout_secs: u64,
    /// Size of each receive buffer.
    pub receive_buffer_bytes: usize,
    /// Largest payload accepted from a peer.
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Tick period for hosts that let the transport drive its own pump.
    pub pump_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_text: DEFAULT_ANNOUNCE_TEXT.to_string(),
            discovery_port: DEFAULT_PORT,
            auto_connect: true,
            server_name: String::new(),
            announce_delay_ms: 1_000,
            announce_interval_ms: 2_000,
            announce_addresses: Vec::new(),
            session_ttl_secs: 0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_secs: 5,
            receive_buffer_bytes: 65_536,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pump_interval_ms: 20,
        }
    }
}

impl DiscoveryConfig {
    pub fn announce_delay(&self) -> Duration {
        Duration::from_millis(self.announce_delay_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_secs > 0).then(|| Duration::from_secs(self.session_ttl_secs))
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("annonet")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl AnnonetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a specific file, falling back to defaults if it doesn't exist.
    /// Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ANNONET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&AnnonetConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply ANNONET_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ANNONET_DISCOVERY__ANNOUNCE_TEXT") {
            self.discovery.announce_text = v;
        }
        if let Some(p) = var("ANNONET_DISCOVERY__PORT").and_then(|v| v.parse().ok()) {
            self.discovery.discovery_port = p;
        }
        if let Some(v) = var("ANNONET_DISCOVERY__AUTO_CONNECT") {
            self.discovery.auto_connect = v == "true" || v == "1";
        }
        if let Some(v) = var("ANNONET_DISCOVERY__SERVER_NAME") {
            self.discovery.server_name = v;
        }
        if let Some(v) = var("ANNONET_DISCOVERY__ANNOUNCE_ADDRESSES") {
            self.discovery.announce_addresses = v
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Some(p) = var("ANNONET_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(t) = var("ANNONET_NETWORK__CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.network.connect_timeout_secs = t;
        }
    }
}
