use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One configured peer hub (spec §4.14 configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationPeerConfig {
    pub hub_id: String,
    pub host: String,
    pub port: u16,
}

/// One device as summarized in a `FEDERATION_SYNC` (spec §3 `RemoteDeviceView`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    pub name: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}
