use std::time::Duration;

/// Default TCP listen port for the mesh transport (spec §4.8).
pub const DEFAULT_TCP_PORT: u16 = 18800;

/// TCP/TLS tuning knobs for [`crate::server::TransportServer`] and
/// [`crate::client::send`] (spec §4.8).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tcp_port: u16,
    pub tls_enabled: bool,
    pub max_frame_size: usize,
    pub connect_timeout: Duration,
    pub frame_read_timeout: Duration,
    pub tls_handshake_timeout: Duration,
}

impl TransportConfig {
    pub fn new(tcp_port: u16) -> Self {
        Self {
            tcp_port,
            tls_enabled: false,
            max_frame_size: mesh_wire::DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(5),
            frame_read_timeout: Duration::from_secs(15),
            tls_handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TCP_PORT)
    }
}
