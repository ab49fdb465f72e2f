//! Configuration loading from `~/.fabric/config.toml` with defaults.
//!
//! Every field has a serde default, so a config file only needs the keys it
//! wants to override:
//!
//! ```toml
//! [network]
//! peers = ["10.0.0.2:7777", "10.0.0.3:7777"]
//! max_peers = 32
//!
//! [network.agent]
//! listen_addr = "0.0.0.0:7777"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default ceiling on simultaneous connections.
pub const MAX_PEERS: usize = 32;

/// Default delay before redialing a lost peer.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Configuration for a single [`Peer`](crate::peer::Peer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Address to bind the listener on.
    pub listen_addr: String,
    /// Fixed node id. A random one is generated when unset.
    pub id: Option<String>,
    /// Addresses dialed as soon as the peer starts.
    pub peers: Vec<String>,
    /// Reject inbound frames whose header hash does not match the payload.
    pub verify_hash: bool,
    /// Forward received `PeerMessage`s to every other connection.
    pub relay: bool,
    /// Maximum number of message ids remembered for dedup.
    pub dedup_capacity: usize,
    /// How long a seen id blocks reprocessing.
    pub dedup_ttl_secs: u64,
    /// Capacity of the per-connection key set (handshake, ping, state root),
    /// kept apart so chatty sessions cannot evict relayed ids.
    pub session_dedup_capacity: usize,
    /// Connection count past which inbound accepts are logged as over
    /// capacity. A swarm sets this to its `max_peers`.
    pub max_connections: usize,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7777".to_string(),
            id: None,
            peers: Vec::new(),
            verify_hash: true,
            relay: false,
            dedup_capacity: 65_536,
            dedup_ttl_secs: 600,
            session_dedup_capacity: 4096,
            max_connections: MAX_PEERS,
            event_capacity: 1024,
        }
    }
}

impl PeerConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

/// Configuration for a [`Swarm`](crate::swarm::Swarm).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Settings for the wrapped agent peer.
    pub agent: PeerConfig,
    /// Seed addresses; also the pool refilled when connections drop.
    pub peers: Vec<String>,
    pub max_peers: usize,
    pub reconnect_delay_secs: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            agent: PeerConfig::default(),
            peers: Vec::new(),
            max_peers: MAX_PEERS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
        }
    }
}

impl SwarmConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub network: SwarmConfig,
}

/// `~/.fabric/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".fabric"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Load configuration, falling back to defaults on any problem.
pub fn load_config(path: Option<&Path>) -> FabricConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return FabricConfig::default();
    }

    match load_config_strict(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            FabricConfig::default()
        }
    }
}

/// Load configuration from `path`, reporting read and parse failures.
pub fn load_config_strict(path: &Path) -> Result<FabricConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
