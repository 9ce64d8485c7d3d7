//! Loads the federation peer list from `federation_config_path` (spec
//! §4.14, §6): `{"peers": [{"hub_id": "...", "host": "...", "port": 0}],
//! "sync_interval_secs": 30}`. Federation is opportunistic: a missing or
//! corrupt file just means the hub starts with no peers rather than
//! failing to boot.

use std::path::Path;

use mesh_federation::FederationPeerConfig;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
struct FederationConfigFile {
    #[serde(default)]
    peers: Vec<FederationPeerConfig>,
    #[serde(default)]
    sync_interval_secs: Option<u64>,
}

pub struct FederationConfig {
    pub peers: Vec<FederationPeerConfig>,
    pub sync_interval_secs: Option<u64>,
}

pub fn load_federation_peers(path: impl AsRef<Path>) -> FederationConfig {
    let path = path.as_ref();
    if !path.exists() {
        return FederationConfig { peers: Vec::new(), sync_interval_secs: None };
    }
    match mesh_core::load_json::<FederationConfigFile>(path) {
        Ok(file) => FederationConfig { peers: file.peers, sync_interval_secs: file.sync_interval_secs },
        Err(err) => {
            warn!(error = %err, path = %path.display(), "federation: corrupt config file, starting with no peers");
            FederationConfig { peers: Vec::new(), sync_interval_secs: None }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_peer_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_federation_peers(dir.path().join("does-not-exist.json"));
        assert!(config.peers.is_empty());
        assert!(config.sync_interval_secs.is_none());
    }

    #[test]
    fn loads_peers_and_sync_interval_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, r#"{"peers":[{"hub_id":"hub-b","host":"10.0.0.2","port":18800}],"sync_interval_secs":15}"#).unwrap();
        let config = load_federation_peers(&path);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].hub_id, "hub-b");
        assert_eq!(config.peers[0].port, 18800);
        assert_eq!(config.sync_interval_secs, Some(15));
    }

    #[test]
    fn corrupt_file_yields_empty_peer_list_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, "not json").unwrap();
        let config = load_federation_peers(&path);
        assert!(config.peers.is_empty());
    }
}
