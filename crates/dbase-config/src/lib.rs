//! Shared configuration for dbase tools
//!
//! Reads from ~/.dbase/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default signaling / credential host
pub const DEFAULT_HOST: &str = "api.securecloudgroup.com";

/// Top-level config structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// "AES-GCM" or "None"
    #[serde(default = "default_encryption_method")]
    pub encryption_method: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encryption_method: default_encryption_method(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            signaling: SignalingConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_credentials_timeout_ms")]
    pub credentials_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            credentials_timeout_ms: default_credentials_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// `wss://{host}/ws/{peer_id}`
    pub fn signaling_url(&self, peer_id: &str) -> String {
        format!("wss://{}/ws/{}", self.host, peer_id)
    }

    /// `https://{host}/fetch_turn_credentials`
    pub fn credentials_url(&self) -> String {
        format!("https://{}/fetch_turn_credentials", self.host)
    }

    /// `https://{host}/get_peers_for_file`
    pub fn peers_url(&self) -> String {
        format!("https://{}/get_peers_for_file", self.host)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_credentials_timeout_ms() -> u64 {
    5000
}

fn default_encryption_method() -> String {
    "AES-GCM".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Local chunk folder; defaults to `{data_dir}/local_store`
    #[serde(default)]
    pub local_store_dir: Option<String>,
    /// Peer chunk folder; defaults to `{data_dir}/peer_store`
    #[serde(default)]
    pub peer_store_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            local_store_dir: None,
            peer_store_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn local_store_path(&self, data_dir: &Path) -> PathBuf {
        self.local_store_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("local_store"))
    }

    pub fn peer_store_path(&self, data_dir: &Path) -> PathBuf {
        self.peer_store_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("peer_store"))
    }
}

fn default_data_dir() -> String {
    get_dbase_dir().join("data").to_string_lossy().to_string()
}

/// Chunking and transfer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_open_poll_attempts")]
    pub open_poll_attempts: u32,
    #[serde(default = "default_open_poll_interval_secs")]
    pub open_poll_interval_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Handshake ack deadline; none waits indefinitely
    #[serde(default)]
    pub ack_timeout_secs: Option<u64>,
    /// Pause sending while this many bytes are queued on a channel
    #[serde(default = "default_buffer_high_water")]
    pub buffer_high_water: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_frame_size: default_max_frame_size(),
            send_retries: default_send_retries(),
            open_poll_attempts: default_open_poll_attempts(),
            open_poll_interval_secs: default_open_poll_interval_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            ack_timeout_secs: None,
            buffer_high_water: default_buffer_high_water(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_max_frame_size() -> usize {
    16 * 1024
}

fn default_send_retries() -> u32 {
    3
}

fn default_open_poll_attempts() -> u32 {
    10
}

fn default_open_poll_interval_secs() -> u64 {
    60
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_buffer_high_water() -> usize {
    1024 * 1024
}

fn default_drain_timeout_secs() -> u64 {
    30
}

/// Relay connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    60
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

/// Local node identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Peer id registered with the relay
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Owner recorded on stored chunks; falls back to the peer id
    #[serde(default)]
    pub owner: Option<String>,
    /// Wallet address used for replica peer lookup
    #[serde(default)]
    pub wallet_address: Option<String>,
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load from an explicit path, writing defaults if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;
        Ok(())
    }

    /// Owner string recorded on chunks and metadata
    pub fn owner(&self) -> Option<&str> {
        self.identity
            .owner
            .as_deref()
            .or(self.identity.peer_id.as_deref())
    }
}

/// Get the dbase directory (~/.dbase)
pub fn get_dbase_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DBASE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dbase")
}

/// Get the config file path (~/.dbase/config.toml)
pub fn get_config_path() -> PathBuf {
    get_dbase_dir().join("config.toml")
}

/// Get the data directory from config (defaults to ~/.dbase/data)
/// Can be overridden with DBASE_DATA_DIR environment variable
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DBASE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let config = Config::load_or_default();
    PathBuf::from(&config.storage.data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.transfer.chunk_size, 131072);
        assert_eq!(config.transfer.max_frame_size, 16384);
        assert_eq!(config.transfer.send_retries, 3);
        assert_eq!(config.signaling.ping_interval_secs, 60);
        assert_eq!(config.encryption_method, "AES-GCM");
        assert!(config.transfer.ack_timeout_secs.is_none());
        assert_eq!(config.transfer.buffer_high_water, 1024 * 1024);
        assert_eq!(config.transfer.drain_timeout_secs, 30);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.transfer.open_poll_attempts, 10);
        assert_eq!(config.signaling.reconnect_delay_secs, 5);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
encryption_method = "None"

[server]
host = "relay.example.org"

[transfer]
max_frame_size = 8192
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.encryption_method, "None");
        assert_eq!(config.server.signaling_url("p1"), "wss://relay.example.org/ws/p1");
        assert_eq!(
            config.server.credentials_url(),
            "https://relay.example.org/fetch_turn_credentials"
        );
        assert_eq!(config.transfer.max_frame_size, 8192);
        assert_eq!(config.transfer.chunk_size, 131072);
    }

    #[test]
    fn test_owner_falls_back_to_peer_id() {
        let mut config = Config::default();
        assert_eq!(config.owner(), None);
        config.identity.peer_id = Some("node-7".to_string());
        assert_eq!(config.owner(), Some("node-7"));
        config.identity.owner = Some("alice".to_string());
        assert_eq!(config.owner(), Some("alice"));
    }

    #[test]
    fn test_store_paths() {
        let storage = StorageConfig::default();
        let data = PathBuf::from("/tmp/d");
        assert_eq!(storage.local_store_path(&data), data.join("local_store"));
        assert_eq!(storage.peer_store_path(&data), data.join("peer_store"));
    }

    #[test]
    fn test_load_creates_default_and_reloads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.host, DEFAULT_HOST);

        let mut changed = config.clone();
        changed.identity.peer_id = Some("abc".to_string());
        changed.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.identity.peer_id.as_deref(), Some("abc"));
    }
}
