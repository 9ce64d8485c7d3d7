//! Hub configuration: a TOML file plus environment-variable overrides,
//! via small `env_var`/`env_u64`/`env_bool` helpers.

use std::env;
use std::path::PathBuf;

use mesh_core::MeshError;
use serde::{Deserialize, Serialize};

fn env_var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|value| value.parse::<u16>().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|value| value.parse::<u32>().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|value| value.parse::<u64>().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|value| value.parse::<usize>().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|value| value.parse::<f64>().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES")).unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|value| {
        value
            .split(',')
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
    })
}

fn env_path(key: &str, default: &PathBuf) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| default.clone())
}

fn default_node_id() -> String {
    env::var("HOSTNAME").ok().filter(|value| !value.is_empty()).unwrap_or_else(|| "mesh-hub".to_string())
}

/// Everything the hub needs to boot (spec §6). Deserialized from TOML,
/// then layered with `MESH_HUB_*` environment overrides so an operator
/// can tweak a container without editing the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub node_id: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub roles: Vec<String>,
    pub device_type: Option<String>,
    pub capabilities: Option<Vec<String>>,

    pub psk_auth_enabled: bool,
    pub key_store_path: PathBuf,
    pub allow_unauthenticated: bool,
    pub nonce_window_seconds: f64,

    pub enrollment_pin_length: u32,
    pub enrollment_pin_timeout: f64,
    pub enrollment_max_attempts: u32,

    pub encryption_enabled: bool,

    pub mtls_enabled: bool,
    pub ca_dir: PathBuf,
    pub device_cert_validity_days: i64,

    pub registry_path: PathBuf,
    pub automation_rules_path: PathBuf,
    pub firmware_dir: PathBuf,
    pub federation_config_path: PathBuf,

    pub ota_offer_timeout: f64,
    pub ota_chunk_ack_timeout: f64,
    pub ota_verify_timeout: f64,
    pub federation_command_timeout_secs: u64,
    pub federation_sync_interval_secs: u64,

    pub max_frame_size: usize,
    pub connect_timeout_secs: u64,
    pub frame_read_timeout_secs: u64,
    pub tls_handshake_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            tcp_port: mesh_transport::DEFAULT_TCP_PORT,
            udp_port: mesh_discovery::DEFAULT_UDP_PORT,
            roles: vec!["hub".to_string()],
            device_type: None,
            capabilities: None,

            psk_auth_enabled: true,
            key_store_path: PathBuf::from("mesh_keys.json"),
            allow_unauthenticated: false,
            nonce_window_seconds: 60.0,

            enrollment_pin_length: 6,
            enrollment_pin_timeout: 300.0,
            enrollment_max_attempts: 3,

            encryption_enabled: true,

            mtls_enabled: false,
            ca_dir: PathBuf::from("ca"),
            device_cert_validity_days: 365,

            registry_path: PathBuf::from("device_registry.json"),
            automation_rules_path: PathBuf::from("automation_rules.json"),
            firmware_dir: PathBuf::from("firmware"),
            federation_config_path: PathBuf::from("federation.json"),

            ota_offer_timeout: mesh_ota::DEFAULT_OFFER_TIMEOUT,
            ota_chunk_ack_timeout: mesh_ota::DEFAULT_CHUNK_ACK_TIMEOUT,
            ota_verify_timeout: mesh_ota::DEFAULT_VERIFY_TIMEOUT,
            federation_command_timeout_secs: mesh_federation::DEFAULT_COMMAND_TIMEOUT.as_secs(),
            federation_sync_interval_secs: mesh_federation::DEFAULT_SYNC_INTERVAL.as_secs(),

            max_frame_size: mesh_wire::DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_secs: 5,
            frame_read_timeout_secs: 15,
            tls_handshake_timeout_secs: 5,
        }
    }
}

impl HubConfig {
    /// Loads `path` if present (TOML), falling back to defaults otherwise,
    /// then applies `MESH_HUB_*` environment overrides on top.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|err| MeshError::Io(err.to_string()))?;
            toml::from_str(&raw).map_err(|err| MeshError::InvalidInput(format!("invalid config file {}: {err}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.node_id = env_var("MESH_HUB_NODE_ID", &self.node_id);
        self.tcp_port = env_u16("MESH_HUB_TCP_PORT", self.tcp_port);
        self.udp_port = env_u16("MESH_HUB_UDP_PORT", self.udp_port);
        if let Some(roles) = env_list("MESH_HUB_ROLES") {
            self.roles = roles;
        }
        if let Ok(device_type) = env::var("MESH_HUB_DEVICE_TYPE") {
            self.device_type = Some(device_type);
        }

        self.psk_auth_enabled = env_bool("MESH_HUB_PSK_AUTH_ENABLED", self.psk_auth_enabled);
        self.key_store_path = env_path("MESH_HUB_KEY_STORE_PATH", &self.key_store_path);
        self.allow_unauthenticated = env_bool("MESH_HUB_ALLOW_UNAUTHENTICATED", self.allow_unauthenticated);
        self.nonce_window_seconds = env_f64("MESH_HUB_NONCE_WINDOW_SECONDS", self.nonce_window_seconds);

        self.enrollment_pin_length = env_u32("MESH_HUB_ENROLLMENT_PIN_LENGTH", self.enrollment_pin_length);
        self.enrollment_pin_timeout = env_f64("MESH_HUB_ENROLLMENT_PIN_TIMEOUT", self.enrollment_pin_timeout);
        self.enrollment_max_attempts = env_u32("MESH_HUB_ENROLLMENT_MAX_ATTEMPTS", self.enrollment_max_attempts);

        self.encryption_enabled = env_bool("MESH_HUB_ENCRYPTION_ENABLED", self.encryption_enabled);

        self.mtls_enabled = env_bool("MESH_HUB_MTLS_ENABLED", self.mtls_enabled);
        self.ca_dir = env_path("MESH_HUB_CA_DIR", &self.ca_dir);
        self.device_cert_validity_days = env_u64("MESH_HUB_DEVICE_CERT_VALIDITY_DAYS", self.device_cert_validity_days as u64) as i64;

        self.registry_path = env_path("MESH_HUB_REGISTRY_PATH", &self.registry_path);
        self.automation_rules_path = env_path("MESH_HUB_AUTOMATION_RULES_PATH", &self.automation_rules_path);
        self.firmware_dir = env_path("MESH_HUB_FIRMWARE_DIR", &self.firmware_dir);
        self.federation_config_path = env_path("MESH_HUB_FEDERATION_CONFIG_PATH", &self.federation_config_path);

        self.max_frame_size = env_usize("MESH_HUB_MAX_FRAME_SIZE", self.max_frame_size);
        self.connect_timeout_secs = env_u64("MESH_HUB_CONNECT_TIMEOUT_SECS", self.connect_timeout_secs);
        self.frame_read_timeout_secs = env_u64("MESH_HUB_FRAME_READ_TIMEOUT_SECS", self.frame_read_timeout_secs);
        self.tls_handshake_timeout_secs = env_u64("MESH_HUB_TLS_HANDSHAKE_TIMEOUT_SECS", self.tls_handshake_timeout_secs);
    }
}
