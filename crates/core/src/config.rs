use std::net::IpAddr;
use std::time::Duration;

use crate::net::COMPANY_SPECTATOR;

/// Tuning for the hosting side. `frame_lead` is the safety margin added
/// when stamping a command's execution frame; `max_lag` is how many
/// unacknowledged frames a peer may fall behind before its ceiling stops
/// advancing.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub server_name: String,
    pub max_peers: usize,
    pub join_key: Option<String>,
    pub ban_list: Vec<IpAddr>,
    pub frame_rate: u32,
    pub frame_lead: u32,
    pub max_lag: u32,
    pub sync_interval: u32,
    pub token_interval: u32,
    pub snapshot_chunk: usize,
    pub handshake_timeout: Duration,
    pub lag_timeout: Duration,
    pub relay: Option<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            server_name: "cadence server".to_string(),
            max_peers: 16,
            join_key: None,
            ban_list: Vec::new(),
            frame_rate: 30,
            frame_lead: 4,
            max_lag: 128,
            sync_interval: 100,
            token_interval: 64,
            snapshot_chunk: 8192,
            handshake_timeout: Duration::from_secs(10),
            lag_timeout: Duration::from_secs(20),
            relay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub company: u8,
    pub join_key: Option<String>,
    pub ack_interval: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            company: COMPANY_SPECTATOR,
            join_key: None,
            ack_interval: 16,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}
