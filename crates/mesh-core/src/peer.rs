use serde::{Deserialize, Serialize};

/// A mesh peer as tracked by discovery (spec §3, C7).
///
/// Lifetime: created on first beacon receipt, refreshed on each subsequent
/// beacon, pruned after `peer_timeout` seconds without a beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub roles: Vec<String>,
    pub last_seen: f64,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

impl Peer {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16, now: f64) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            roles: Vec::new(),
            last_seen: now,
            device_type: None,
            capabilities: None,
        }
    }

    pub fn is_stale(&self, now: f64, peer_timeout: f64) -> bool {
        now - self.last_seen > peer_timeout
    }
}
