//! Configuration system for Meridian.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MERIDIAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meridian/config.toml
//!   3. ~/.config/meridian/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest chunk that still fits a hex-encoded CHUNK reply in one datagram.
pub const MAX_CHUNK_SIZE: u32 = 28 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub dht: DhtConfig,
    pub transfer: TransferConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex node id. Generated on first run.
    pub node_id_path: PathBuf,
    /// Root of the on-disk chunk cache.
    pub cache_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for peer traffic. 0 = OS-assigned.
    pub port: u16,
    /// HTTP port for the dashboard API.
    pub api_port: u16,
    /// Seed peers, "host:port".
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,
    /// Bucket capacity and lookup result size.
    pub k: usize,
    /// Concurrent queries per lookup round.
    pub alpha: usize,
    /// Consecutive failures before a peer is evicted.
    pub failure_limit: u32,
    pub query_timeout_ms: u64,
    pub lookup_deadline_ms: u64,
    pub provider_ttl_secs: u64,
    pub max_provider_ttl_secs: u64,
    pub peer_inactivity_secs: u64,
    /// Peers seen within this window without failures count as active.
    pub active_window_secs: u64,
    pub bucket_sweep_secs: u64,
    pub provider_sweep_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: u32,
    /// Most peers asked for the same chunk at once.
    pub max_peer_requests_per_chunk: usize,
    /// Request slots per peer, shared across sessions.
    pub peer_slots: usize,
    pub max_in_flight_per_session: usize,
    pub max_active_downloads: usize,
    /// EWMA weight of the newest speed sample, in (0, 1].
    pub speed_smoothing: f64,
    /// Consecutive empty peer selections before a session fails.
    pub selection_retries: u32,
    pub chunk_timeout_ms: u64,
    pub provider_refresh_secs: u64,
    pub upload_idle_secs: u64,
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes per second. 0 = unlimited.
    pub max_download_bps: u64,
    /// Bytes per second. 0 = unlimited.
    pub max_upload_bps: u64,
    /// Distinct peers with outstanding download requests. 0 = unlimited.
    pub max_connections: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id_path: config_dir().join("node_id"),
            cache_path: data_dir().join("chunks"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 4100,
            api_port: 9001,
            bootstrap: Vec::new(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: 20,
            alpha: 3,
            failure_limit: 3,
            query_timeout_ms: 5_000,
            lookup_deadline_ms: 30_000,
            provider_ttl_secs: 3_600,
            max_provider_ttl_secs: 86_400,
            peer_inactivity_secs: 900,
            active_window_secs: 120,
            bucket_sweep_secs: 60,
            provider_sweep_secs: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            max_peer_requests_per_chunk: 2,
            peer_slots: 4,
            max_in_flight_per_session: 16,
            max_active_downloads: 3,
            speed_smoothing: 0.3,
            selection_retries: 5,
            chunk_timeout_ms: 10_000,
            provider_refresh_secs: 15,
            upload_idle_secs: 30,
            tick_ms: 250,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_download_bps: 0,
            max_upload_bps: 0,
            max_connections: 64,
        }
    }
}

impl DhtConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn lookup_deadline(&self) -> Duration {
        Duration::from_millis(self.lookup_deadline_ms)
    }

    pub fn provider_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_ttl_secs)
    }

    pub fn max_provider_ttl(&self) -> Duration {
        Duration::from_secs(self.max_provider_ttl_secs)
    }

    pub fn peer_inactivity(&self) -> Duration {
        Duration::from_secs(self.peer_inactivity_secs)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }
}

impl TransferConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn provider_refresh(&self) -> Duration {
        Duration::from_secs(self.provider_refresh_secs)
    }

    pub fn upload_idle(&self) -> Duration {
        Duration::from_secs(self.upload_idle_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meridian")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("meridian")
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeridianConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeridianConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeridianConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dht = &self.dht;
        let transfer = &self.transfer;
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if dht.k == 0 {
            return invalid("dht.k must be at least 1");
        }
        if dht.alpha == 0 {
            return invalid("dht.alpha must be at least 1");
        }
        if dht.failure_limit == 0 {
            return invalid("dht.failure_limit must be at least 1");
        }
        if dht.query_timeout_ms == 0 || dht.lookup_deadline_ms == 0 {
            return invalid("dht timeouts must be non-zero");
        }
        if dht.provider_ttl_secs == 0 || dht.provider_ttl_secs > dht.max_provider_ttl_secs {
            return invalid("dht.provider_ttl_secs must be in 1..=max_provider_ttl_secs");
        }
        if transfer.chunk_timeout_ms == 0 || transfer.tick_ms == 0 {
            return invalid("transfer timeouts must be non-zero");
        }
        if !(transfer.speed_smoothing > 0.0 && transfer.speed_smoothing <= 1.0) {
            return invalid("transfer.speed_smoothing must be in (0, 1]");
        }
        if transfer.chunk_size == 0 || transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transfer.chunk_size must be in 1..={MAX_CHUNK_SIZE}"
            )));
        }
        if transfer.max_peer_requests_per_chunk == 0 {
            return invalid("transfer.max_peer_requests_per_chunk must be at least 1");
        }
        if transfer.peer_slots == 0 || transfer.max_in_flight_per_session == 0 {
            return invalid("transfer slot limits must be at least 1");
        }
        if transfer.max_active_downloads == 0 {
            return invalid("transfer.max_active_downloads must be at least 1");
        }
        Ok(())
    }

    /// Apply MERIDIAN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("MERIDIAN_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(p) = var("MERIDIAN_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = var("MERIDIAN_NETWORK__BOOTSTRAP") {
            self.network.bootstrap = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = var("MERIDIAN_LIMITS__MAX_DOWNLOAD_BPS").and_then(|v| v.parse().ok()) {
            self.limits.max_download_bps = n;
        }
        if let Some(n) = var("MERIDIAN_LIMITS__MAX_UPLOAD_BPS").and_then(|v| v.parse().ok()) {
            self.limits.max_upload_bps = n;
        }
        if let Some(n) = var("MERIDIAN_LIMITS__MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.limits.max_connections = n;
        }
        if let Some(v) = var("MERIDIAN_DHT__ENABLED") {
            self.dht.enabled = v == "true" || v == "1";
        }
    }
}
