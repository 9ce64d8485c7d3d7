use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{Envelope, MessageType};
use tokio::io::split;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type DispatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type LinkHandler = Arc<dyn Fn(Envelope) -> DispatchFuture + Send + Sync>;

/// Notified with `true` right after the link connects and `false` whenever
/// it drops (connect failure, timeout, or an established connection
/// closing) so the owner can mark a peer's cached devices offline between
/// reconnect attempts (spec §4.14 graceful degradation).
pub type LinkStateHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Default keepalive interval (spec §4.14).
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Reconnect backoff bounds (spec §4.14): base 2s, cap 60s.
pub const RECONNECT_BASE: Duration = Duration::from_secs(2);
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HubLinkConfig {
    pub own_hub_id: String,
    pub peer_hub_id: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_frame_size: usize,
}

/// Handle to a running [`HubLink`] background task: an outbound mpsc queue
/// plus the task itself, so the manager can push envelopes without holding
/// the socket.
pub struct HubLinkHandle {
    outbound: mpsc::Sender<Envelope>,
    task: tokio::task::JoinHandle<()>,
}

impl HubLinkHandle {
    /// Best-effort enqueue; `false` means the link's outbound queue is full
    /// or the task has exited.
    pub fn push(&self, env: Envelope) -> bool {
        self.outbound.try_send(env).is_ok()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Starts the persistent connection lifecycle for one peer hub (spec
/// §4.14): connect, send `FEDERATION_HELLO`, then loop reading inbound
/// frames (dispatched via `handler`) and keepalive-ping/outbound-queue
/// writes, reconnecting with exponential backoff on any disconnect.
/// `on_state_change` fires `true` on a successful connect and `false` on
/// every disconnect, including a failed or timed-out connect attempt.
pub fn start(config: HubLinkConfig, handler: LinkHandler, on_state_change: LinkStateHandler) -> HubLinkHandle {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(run(config, rx, handler, on_state_change));
    HubLinkHandle { outbound: tx, task }
}

async fn run(config: HubLinkConfig, mut rx: mpsc::Receiver<Envelope>, handler: LinkHandler, on_state_change: LinkStateHandler) {
    let mut backoff = RECONNECT_BASE;
    loop {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect((config.host.as_str(), config.port))).await {
            Ok(Ok(stream)) => {
                info!(peer = %config.peer_hub_id, "federation: link established");
                backoff = RECONNECT_BASE;
                on_state_change(true);
                drive(stream, &config, &mut rx, &handler).await;
                debug!(peer = %config.peer_hub_id, "federation: link closed, will reconnect");
                on_state_change(false);
            }
            Ok(Err(err)) => {
                debug!(peer = %config.peer_hub_id, error = %err, "federation: connect failed");
                on_state_change(false);
            }
            Err(_) => {
                debug!(peer = %config.peer_hub_id, "federation: connect timed out");
                on_state_change(false);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = Duration::from_secs_f64((backoff.as_secs_f64() * 2.0).min(RECONNECT_MAX.as_secs_f64()));
    }
}

fn hello_envelope(config: &HubLinkConfig) -> Envelope {
    let mut env = Envelope::new(MessageType::FederationHello, config.own_hub_id.clone(), config.peer_hub_id.clone(), mesh_core::now_secs());
    env.payload.insert("hub_id".to_string(), serde_json::Value::String(config.own_hub_id.clone()));
    env
}

fn ping_envelope(config: &HubLinkConfig) -> Envelope {
    Envelope::new(MessageType::FederationPing, config.own_hub_id.clone(), config.peer_hub_id.clone(), mesh_core::now_secs())
}

async fn drive(stream: TcpStream, config: &HubLinkConfig, rx: &mut mpsc::Receiver<Envelope>, handler: &LinkHandler) {
    let (mut read_half, mut write_half) = split(stream);
    if mesh_wire::write_envelope(&mut write_half, &hello_envelope(config), config.max_frame_size).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(config.keepalive_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if mesh_wire::write_envelope(&mut write_half, &ping_envelope(config), config.max_frame_size).await.is_err() {
                    return;
                }
            }
            outbound = rx.recv() => {
                let Some(env) = outbound else { return };
                if mesh_wire::write_envelope(&mut write_half, &env, config.max_frame_size).await.is_err() {
                    return;
                }
            }
            incoming = mesh_wire::read_envelope(&mut read_half, config.max_frame_size) => {
                let Some(env) = incoming else { return };
                handler(env).await;
            }
        }
    }
}
