use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_core::Peer;
use mesh_resilience::Watchdog;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::beacon::Beacon;
use crate::table::PeerTable;

pub const DEFAULT_UDP_PORT: u16 = 18799;
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub node_id: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub roles: Vec<String>,
    pub device_type: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
}

impl DiscoveryConfig {
    pub fn new(node_id: impl Into<String>, tcp_port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            tcp_port,
            udp_port: DEFAULT_UDP_PORT,
            roles: vec!["hub".to_string()],
            device_type: None,
            capabilities: None,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerSeen(Peer),
    PeerLost(String),
}

type EventCallback = Box<dyn Fn(&DiscoveryEvent) + Send + Sync>;

/// UDP beacon broadcaster/receiver and peer freshness table (spec §4.7).
/// Discovery carries no trust; it only feeds `on_peer_seen`/
/// `on_peer_lost` to whoever registered a callback (normally the mesh
/// channel, for auto-registration).
pub struct DiscoveryService {
    config: DiscoveryConfig,
    table: Arc<Mutex<PeerTable>>,
    callbacks: Arc<Mutex<Vec<EventCallback>>>,
    broadcaster: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    watchdog: Option<Watchdog>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(PeerTable::new())),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            broadcaster: None,
            receiver: None,
            watchdog: None,
        }
    }

    pub fn on_event(&self, callback: impl Fn(&DiscoveryEvent) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    fn fire(callbacks: &Mutex<Vec<EventCallback>>, event: DiscoveryEvent) {
        for callback in callbacks.lock().unwrap().iter() {
            callback(&event);
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.table.lock().unwrap().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<Peer> {
        self.table.lock().unwrap().list().into_iter().cloned().collect()
    }

    /// Binds the UDP socket and starts the broadcaster, receiver, and
    /// prune-watchdog tasks. Idempotent only in the sense that calling it
    /// twice leaks the first socket's tasks — callers call this once from
    /// `MeshChannel::start`.
    pub async fn start(&mut self) -> std::io::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.udp_port)).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        self.broadcaster = Some(tokio::spawn(broadcaster_loop(socket.clone(), self.config.clone())));
        self.receiver = Some(tokio::spawn(receiver_loop(
            socket,
            self.config.clone(),
            self.table.clone(),
            self.callbacks.clone(),
        )));

        let prune_table = self.table.clone();
        let prune_callbacks = self.callbacks.clone();
        let peer_timeout = self.config.peer_timeout.as_secs_f64();
        self.watchdog = Some(Watchdog::start(self.config.peer_timeout / 2, move || {
            let table = prune_table.clone();
            let callbacks = prune_callbacks.clone();
            async move {
                let lost = table.lock().unwrap().prune(mesh_core::now_secs(), peer_timeout);
                for node_id in lost {
                    info!(node_id, "discovery: peer lost (stale)");
                    Self::fire(&callbacks, DiscoveryEvent::PeerLost(node_id));
                }
                Ok(())
            }
        }));

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.broadcaster.take() {
            handle.abort();
        }
        if let Some(handle) = self.receiver.take() {
            handle.abort();
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn broadcaster_loop(socket: Arc<UdpSocket>, config: DiscoveryConfig) {
    let beacon = Beacon {
        node_id: config.node_id.clone(),
        tcp_port: config.tcp_port,
        roles: config.roles.clone(),
        device_type: config.device_type.clone(),
        capabilities: config.capabilities.clone(),
    };
    let bytes = beacon.to_json_bytes();
    let dest = ("255.255.255.255", config.udp_port);
    let mut ticker = tokio::time::interval(config.beacon_interval);
    loop {
        ticker.tick().await;
        if let Err(err) = socket.send_to(&bytes, dest).await {
            warn!(error = %err, "discovery: beacon broadcast failed");
        }
    }
}

async fn receiver_loop(
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    table: Arc<Mutex<PeerTable>>,
    callbacks: Arc<Mutex<Vec<EventCallback>>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "discovery: recv failed");
                continue;
            }
        };
        let Some(beacon) = Beacon::from_json_bytes(&buf[..len]) else {
            debug!("discovery: dropped malformed beacon");
            continue;
        };
        if beacon.node_id == config.node_id {
            continue;
        }
        let host = addr.ip().to_string();
        let now = mesh_core::now_secs();
        let (is_new, peer) = {
            let mut table = table.lock().unwrap();
            let is_new = table.observe(&beacon, &host, now);
            (is_new, table.get(&beacon.node_id).cloned())
        };
        if is_new {
            if let Some(peer) = peer {
                info!(node_id = %beacon.node_id, host, "discovery: peer seen");
                DiscoveryService::fire(&callbacks, DiscoveryEvent::PeerSeen(peer));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn start_binds_and_stop_is_clean() {
        let mut service = DiscoveryService::new(DiscoveryConfig {
            udp_port: 0,
            beacon_interval: StdDuration::from_millis(20),
            ..DiscoveryConfig::new("hub-a", 18800)
        });
        service.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        service.stop();
        assert!(service.list().is_empty());
    }

    #[tokio::test]
    async fn self_beacons_are_ignored_by_node_id() {
        let mut table = PeerTable::new();
        let own = Beacon { node_id: "hub-a".to_string(), tcp_port: 18800, roles: vec![], device_type: None, capabilities: None };
        // Mirrors the node_id check in `receiver_loop`: a beacon matching
        // our own node_id never reaches `observe`.
        if own.node_id != "hub-a" {
            table.observe(&own, "127.0.0.1", 0.0);
        }
        assert!(table.list().is_empty());
    }
}
