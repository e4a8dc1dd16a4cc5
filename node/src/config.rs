//! Node configuration with TOML file support.

use std::path::Path;
use std::time::Duration;

use meridian_network::SyncConfig;
use meridian_protocol::SOFT_VERSION;
use meridian_types::NetworkId;
use serde::{Deserialize, Serialize};

use crate::NodeError;

/// Configuration for a meridian P2P node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). Every field has a default, so
/// an empty file is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which network to join; selects the frame magic.
    #[serde(default = "default_network")]
    pub network: NetworkId,

    /// Port to listen on for P2P connections.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Advertised http info port, 0 when there is none.
    #[serde(default)]
    pub http_info_port: u16,

    /// Software version announced in the handshake.
    #[serde(default = "default_soft_version")]
    pub soft_version: String,

    /// Leading zero bits demanded of peer identity keys.
    #[serde(default = "default_identity_difficulty")]
    pub identity_difficulty: u32,

    /// Addresses dialed while outbound connectivity is low.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_conn")]
    pub max_in_bound: usize,

    #[serde(default = "default_max_conn")]
    pub max_out_bound: usize,

    #[serde(default = "default_max_in_bound_per_ip")]
    pub max_in_bound_per_ip: usize,

    /// Only talk to `reserved_peers`.
    #[serde(default)]
    pub reserved_only: bool,

    /// IPs or domain names.
    #[serde(default)]
    pub reserved_peers: Vec<String>,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_min_outbound")]
    pub min_outbound: usize,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Peers hidden from everybody except each other.
    #[serde(default)]
    pub mask_peers: Vec<String>,
}

/// The `[sync]` table; unset fields keep the block sync defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_max_header_forward")]
    pub max_header_forward: u32,

    #[serde(default = "default_max_flight_headers")]
    pub max_flight_headers: usize,

    #[serde(default = "default_max_flight_blocks")]
    pub max_flight_blocks: usize,

    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> NetworkId {
    NetworkId::Dev
}

fn default_listen_port() -> u16 {
    NetworkId::Dev.default_port()
}

fn default_soft_version() -> String {
    SOFT_VERSION.to_string()
}

fn default_identity_difficulty() -> u32 {
    meridian_crypto::DEFAULT_DIFFICULTY
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_conn() -> usize {
    1024
}

fn default_max_in_bound_per_ip() -> usize {
    16
}

fn default_dial_timeout() -> u64 {
    6
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_min_outbound() -> usize {
    4
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_keepalive_timeout() -> u64 {
    45
}

fn default_reconnect_interval() -> u64 {
    6
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_max_header_forward() -> u32 {
    SyncConfig::default().max_header_forward
}

fn default_max_flight_headers() -> usize {
    SyncConfig::default().max_flight_headers
}

fn default_max_flight_blocks() -> usize {
    SyncConfig::default().max_flight_blocks
}

fn default_block_cache_size() -> usize {
    SyncConfig::default().block_cache_size
}

fn default_request_timeout() -> u64 {
    SyncConfig::default().block_timeout.as_secs()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }
}

impl ConnectionConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

impl DiscoveryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl SyncSection {
    /// Block sync settings with this table applied over the defaults.
    pub fn to_sync_config(&self) -> SyncConfig {
        let timeout = Duration::from_secs(self.request_timeout_secs);
        SyncConfig {
            max_header_forward: self.max_header_forward,
            max_flight_headers: self.max_flight_headers,
            max_flight_blocks: self.max_flight_blocks,
            block_cache_size: self.block_cache_size,
            header_timeout: timeout,
            block_timeout: timeout,
            ..SyncConfig::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            listen_port: default_listen_port(),
            http_info_port: 0,
            soft_version: default_soft_version(),
            identity_difficulty: default_identity_difficulty(),
            seeds: Vec::new(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            enable_metrics: false,
            connection: ConnectionConfig::default(),
            discovery: DiscoveryConfig::default(),
            sync: SyncSection::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_in_bound: default_max_conn(),
            max_out_bound: default_max_conn(),
            max_in_bound_per_ip: default_max_in_bound_per_ip(),
            reserved_only: false,
            reserved_peers: Vec::new(),
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            min_outbound: default_min_outbound(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            mask_peers: Vec::new(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            max_header_forward: default_max_header_forward(),
            max_flight_headers: default_max_flight_headers(),
            max_flight_blocks: default_max_flight_blocks(),
            block_cache_size: default_block_cache_size(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}
