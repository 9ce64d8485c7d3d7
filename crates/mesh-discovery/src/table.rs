use std::collections::BTreeMap;

use mesh_core::Peer;

use crate::beacon::Beacon;

/// Freshness table of peers seen via beacon (spec §4.7). Keyed by
/// `node_id`; a fresh id is a new peer, a known id just refreshes
/// `last_seen` and any carried `device_type`/`capabilities`.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<String, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self { peers: BTreeMap::new() }
    }

    /// Applies a received beacon from `host`. Returns `true` if this is a
    /// previously-unseen `node_id`.
    pub fn observe(&mut self, beacon: &Beacon, host: &str, now: f64) -> bool {
        match self.peers.get_mut(&beacon.node_id) {
            Some(peer) => {
                peer.host = host.to_string();
                peer.port = beacon.tcp_port;
                peer.roles = beacon.roles.clone();
                peer.last_seen = now;
                if beacon.device_type.is_some() {
                    peer.device_type = beacon.device_type.clone();
                }
                if beacon.capabilities.is_some() {
                    peer.capabilities = beacon.capabilities.clone();
                }
                false
            }
            None => {
                let mut peer = Peer::new(beacon.node_id.clone(), host, beacon.tcp_port, now);
                peer.roles = beacon.roles.clone();
                peer.device_type = beacon.device_type.clone();
                peer.capabilities = beacon.capabilities.clone();
                self.peers.insert(beacon.node_id.clone(), peer);
                true
            }
        }
    }

    /// Evicts peers stale by `peer_timeout` and returns their ids.
    pub fn prune(&mut self, now: f64, peer_timeout: f64) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.is_stale(now, peer_timeout))
            .map(|peer| peer.node_id.clone())
            .collect();
        for node_id in &stale {
            self.peers.remove(node_id);
        }
        stale
    }

    pub fn get(&self, node_id: &str) -> Option<&Peer> {
        self.peers.get(node_id)
    }

    pub fn list(&self) -> Vec<&Peer> {
        self.peers.values().collect()
    }
}
