//! Configuration.
//!
//! Loads networking configuration from JSON strings (file IO left to app).

use serde::{Deserialize, Serialize};

use crate::{queue::OverflowPolicy, transport::TransportKind};

/// Default listen/connect port.
pub const DEFAULT_PORT: u16 = 27020;

/// Root configuration shared by host and peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Which backend to use.
    #[serde(default)]
    pub transport: TransportKind,
    /// Remote address for peers.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name advertised by a host.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Local player name.
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Level a peer returns to after disconnecting.
    #[serde(default = "default_level")]
    pub default_level: String,
    /// Roster ceiling, the host's own player included.
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Credential a peer presents during validation.
    #[serde(default = "default_validation_token")]
    pub validation_token: String,
    /// Ticks between latency probes.
    #[serde(default = "default_ping_interval_ticks")]
    pub ping_interval_ticks: u32,
    /// Pending connections that have not validated within this window are kicked.
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,
    /// Native close attempts before a kick gives up.
    #[serde(default = "default_kick_retries")]
    pub kick_retries: u32,
    /// Tick rate for the standalone binaries.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Incoming packets buffered between ticks.
    #[serde(default = "default_queue_capacity")]
    pub inbox_capacity: usize,
    /// Outgoing messages buffered until the end-of-tick flush.
    #[serde(default = "default_queue_capacity")]
    pub outbox_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Maximum number of registered RPC triples.
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_server_name() -> String {
    "netplay".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_level() -> String {
    "MainMenu".to_string()
}

fn default_max_players() -> usize {
    16
}

fn default_validation_token() -> String {
    "netplay-v1".to_string()
}

fn default_ping_interval_ticks() -> u32 {
    60
}

fn default_validation_timeout_ms() -> u64 {
    10_000
}

fn default_kick_retries() -> u32 {
    50
}

fn default_tick_hz() -> u32 {
    64
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_registry_capacity() -> usize {
    4096
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            address: default_address(),
            port: default_port(),
            server_name: default_server_name(),
            player_name: default_player_name(),
            default_level: default_level(),
            max_players: default_max_players(),
            validation_token: default_validation_token(),
            ping_interval_ticks: default_ping_interval_ticks(),
            validation_timeout_ms: default_validation_timeout_ms(),
            kick_retries: default_kick_retries(),
            tick_hz: default_tick_hz(),
            inbox_capacity: default_queue_capacity(),
            outbox_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            registry_capacity: default_registry_capacity(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
