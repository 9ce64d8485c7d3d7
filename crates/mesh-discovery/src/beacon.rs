use serde::{Deserialize, Serialize};

/// UDP beacon payload broadcast every `beacon_interval` seconds (spec
/// §4.7). Carries no authentication — discovery is trust-free, the
/// security stack lives in C4/C6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub node_id: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

impl Beacon {
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let beacon = Beacon {
            node_id: "esp32-kitchen".to_string(),
            tcp_port: 18800,
            roles: vec!["device".to_string()],
            device_type: Some("sensor".to_string()),
            capabilities: Some(vec!["temperature".to_string()]),
        };
        let bytes = beacon.to_json_bytes();
        let back = Beacon::from_json_bytes(&bytes).unwrap();
        assert_eq!(back.node_id, "esp32-kitchen");
        assert_eq!(back.capabilities, Some(vec!["temperature".to_string()]));
    }

    #[test]
    fn garbage_bytes_fail_closed() {
        assert!(Beacon::from_json_bytes(b"not json").is_none());
    }
}
