use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_core::{DeviceValue, Envelope, MessageType};
use mesh_registry::Response;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::link::{self, HubLinkConfig, HubLinkHandle};
use crate::send::send_plain;
use crate::types::{FederationPeerConfig, RemoteDevice};

/// Default per-command correlation timeout (spec §4.14, §5 timeouts).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Default `FEDERATION_SYNC` interval (spec §4.14).
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Executes a resolved `{target_node, capability, value}` against the local
/// registry/transport stack and returns the result. Installed by the
/// orchestrator at construction time (spec §9 opaque-handle pattern) so
/// `mesh-federation` never depends on `mesh-transport` or the channel.
pub type LocalCommandExecutor =
    Arc<dyn Fn(String, String, DeviceValue) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync>;

/// Snapshots the hub's own devices for the next `FEDERATION_SYNC`.
pub type LocalDevicesSnapshot = Arc<dyn Fn() -> Vec<RemoteDevice> + Send + Sync>;

struct LinkEntry {
    handle: HubLinkHandle,
    host: String,
    port: u16,
}

/// Hub-to-hub federation (spec §4.14): owns one [`crate::link::HubLink`]
/// per configured peer, the `remote_devices` view refreshed by
/// `FEDERATION_SYNC`, and the `FEDERATION_COMMAND`/`FEDERATION_RESPONSE`
/// correlation table. Cheaply `Clone`: every field is `Arc`-backed so the
/// same manager can be captured by each link's inbound-dispatch closure.
#[derive(Clone)]
pub struct FederationManager {
    own_hub_id: String,
    connect_timeout: Duration,
    max_frame_size: usize,
    command_timeout: Duration,
    links: Arc<Mutex<HashMap<String, LinkEntry>>>,
    remote_devices: Arc<Mutex<HashMap<String, Vec<RemoteDevice>>>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>,
    seq: Arc<AtomicU64>,
    sync_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FederationManager {
    pub fn new(own_hub_id: impl Into<String>, connect_timeout: Duration, max_frame_size: usize) -> Self {
        Self {
            own_hub_id: own_hub_id.into(),
            connect_timeout,
            max_frame_size,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            links: Arc::new(Mutex::new(HashMap::new())),
            remote_devices: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            sync_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts one [`crate::link::HubLink`] per configured peer and a
    /// periodic `FEDERATION_SYNC` broadcaster. `local_command` is consulted
    /// whenever a peer's `FEDERATION_COMMAND` targets a device this hub
    /// owns; `local_devices` supplies the snapshot each sync tick sends.
    pub fn start(&self, peers: Vec<FederationPeerConfig>, sync_interval: Duration, local_command: LocalCommandExecutor, local_devices: LocalDevicesSnapshot) {
        for peer in peers {
            let manager = self.clone();
            let local_command = local_command.clone();
            let handler: link::LinkHandler = Arc::new(move |env: Envelope| {
                let manager = manager.clone();
                let local_command = local_command.clone();
                Box::pin(async move { manager.handle(env, &local_command).await })
            });
            let state_manager = self.clone();
            let state_peer_hub_id = peer.hub_id.clone();
            let on_state_change: link::LinkStateHandler = Arc::new(move |connected| {
                if !connected {
                    state_manager.mark_hub_offline(&state_peer_hub_id);
                }
            });
            let config = HubLinkConfig {
                own_hub_id: self.own_hub_id.clone(),
                peer_hub_id: peer.hub_id.clone(),
                host: peer.host.clone(),
                port: peer.port,
                connect_timeout: self.connect_timeout,
                keepalive_interval: link::DEFAULT_KEEPALIVE_INTERVAL,
                max_frame_size: self.max_frame_size,
            };
            let handle = link::start(config, handler, on_state_change);
            self.links.lock().unwrap().insert(peer.hub_id.clone(), LinkEntry { handle, host: peer.host, port: peer.port });
        }

        let manager = self.clone();
        let sync_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_interval);
            loop {
                ticker.tick().await;
                let devices = local_devices();
                manager.broadcast_sync(devices);
            }
        });
        *self.sync_task.lock().unwrap() = Some(sync_task);
    }

    /// Marks every cached device of `hub_id` offline without discarding the
    /// remote view (spec §4.14 graceful degradation). Called whenever that
    /// hub's [`crate::link::HubLink`] reports a disconnect.
    fn mark_hub_offline(&self, hub_id: &str) {
        if let Some(devices) = self.remote_devices.lock().unwrap().get_mut(hub_id) {
            for device in devices.iter_mut() {
                device.online = false;
            }
        }
    }

    /// Stops every link task and the sync broadcaster (spec §4.15, §5:
    /// cooperative cancellation on `stop()`).
    pub fn stop(&self) {
        for (_, entry) in self.links.lock().unwrap().drain() {
            entry.handle.stop();
        }
        if let Some(task) = self.sync_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn broadcast_sync(&self, devices: Vec<RemoteDevice>) {
        let payload = serde_json::json!({ "hub_id": self.own_hub_id, "devices": devices });
        let Value::Object(payload) = payload else { return };
        let links = self.links.lock().unwrap();
        for (peer_hub_id, entry) in links.iter() {
            let mut env = Envelope::new(MessageType::FederationSync, self.own_hub_id.clone(), peer_hub_id.clone(), mesh_core::now_secs());
            env.payload = payload.clone();
            if !entry.handle.push(env) {
                debug!(peer = %peer_hub_id, "federation: sync dropped, link queue full or down");
            }
        }
    }

    /// Pushes a single device's state to every peer immediately (spec
    /// §4.14 `FEDERATION_STATE`), outside the regular sync cadence.
    pub fn broadcast_state(&self, node_id: &str, state: Map<String, Value>) {
        let links = self.links.lock().unwrap();
        for (peer_hub_id, entry) in links.iter() {
            let mut env = Envelope::new(MessageType::FederationState, self.own_hub_id.clone(), peer_hub_id.clone(), mesh_core::now_secs());
            env.payload.insert("node_id".to_string(), Value::String(node_id.to_string()));
            env.payload.insert("state".to_string(), Value::Object(state.clone()));
            entry.handle.push(env);
        }
    }

    /// Sends a `FEDERATION_COMMAND` to `hub_id` and awaits its
    /// `FEDERATION_RESPONSE`, correlated by an explicit `request_id` (spec
    /// §4.14, REDESIGN FLAGS). `None` on an unknown hub, a send failure, or
    /// a timeout.
    pub async fn forward_command(&self, hub_id: &str, node_id: &str, capability: &str, value: DeviceValue) -> Option<Response> {
        let (host, port) = {
            let links = self.links.lock().unwrap();
            let entry = links.get(hub_id)?;
            (entry.host.clone(), entry.port)
        };
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);

        let mut env = Envelope::new(MessageType::FederationCommand, self.own_hub_id.clone(), hub_id.to_string(), mesh_core::now_secs());
        env.payload.insert("request_id".to_string(), Value::String(request_id.clone()));
        env.payload.insert("target_node".to_string(), Value::String(node_id.to_string()));
        env.payload.insert("capability".to_string(), Value::String(capability.to_string()));
        env.payload.insert("value".to_string(), serde_json::to_value(&value).ok()?);

        if !send_plain(&host, port, &env, self.connect_timeout, self.max_frame_size).await {
            self.pending.lock().unwrap().remove(&request_id);
            return None;
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            _ => {
                self.pending.lock().unwrap().remove(&request_id);
                warn!(hub_id, node_id, "federation: command timed out waiting for response");
                None
            }
        }
    }

    /// Dispatch entry point for every `FEDERATION_*` envelope, whether
    /// delivered over this hub's own outbound [`crate::link::HubLink`] or
    /// accepted inbound by `mesh-transport`'s generic listener.
    pub async fn handle(&self, env: Envelope, local_command: &LocalCommandExecutor) {
        match env.kind {
            MessageType::FederationHello => {
                debug!(hub_id = %env.source, "federation: hello received");
            }
            MessageType::FederationPing => {
                let pong = Envelope::new(MessageType::FederationPong, self.own_hub_id.clone(), env.source.clone(), mesh_core::now_secs());
                self.reply(&env.source, pong).await;
            }
            MessageType::FederationPong => {}
            MessageType::FederationSync => {
                let Some(devices) = env.payload.get("devices").cloned() else { return };
                let Ok(devices) = serde_json::from_value::<Vec<RemoteDevice>>(devices) else { return };
                self.remote_devices.lock().unwrap().insert(env.source.clone(), devices);
            }
            MessageType::FederationState => {
                let Some(node_id) = env.payload.get("node_id").and_then(Value::as_str) else { return };
                let Some(state) = env.payload.get("state").and_then(Value::as_object) else { return };
                let mut remote = self.remote_devices.lock().unwrap();
                if let Some(devices) = remote.get_mut(&env.source) {
                    if let Some(device) = devices.iter_mut().find(|d| d.node_id == node_id) {
                        device.state = state.clone();
                    }
                }
            }
            MessageType::FederationCommand => {
                self.handle_command(env, local_command).await;
            }
            MessageType::FederationResponse => {
                let Some(request_id) = env.payload.get("request_id").and_then(Value::as_str) else { return };
                let Some(tx) = self.pending.lock().unwrap().remove(request_id) else { return };
                let Some(response) = env.payload.get("response").cloned().and_then(|v| serde_json::from_value(v).ok()) else { return };
                let _ = tx.send(response);
            }
            _ => {}
        }
    }

    async fn handle_command(&self, env: Envelope, local_command: &LocalCommandExecutor) {
        let Some(request_id) = env.payload.get("request_id").and_then(Value::as_str).map(str::to_string) else { return };
        let Some(target_node) = env.payload.get("target_node").and_then(Value::as_str).map(str::to_string) else { return };
        let Some(capability) = env.payload.get("capability").and_then(Value::as_str).map(str::to_string) else { return };
        let Some(value) = env.payload.get("value").cloned().and_then(|v| serde_json::from_value::<DeviceValue>(v).ok()) else { return };

        let response = local_command(target_node, capability, value).await;

        let (host, port) = {
            let links = self.links.lock().unwrap();
            match links.get(&env.source) {
                Some(entry) => (entry.host.clone(), entry.port),
                None => return,
            }
        };
        let mut reply = Envelope::new(MessageType::FederationResponse, self.own_hub_id.clone(), env.source.clone(), mesh_core::now_secs());
        reply.payload.insert("request_id".to_string(), Value::String(request_id));
        reply.payload.insert("response".to_string(), serde_json::to_value(&response).unwrap_or(Value::Null));
        send_plain(&host, port, &reply, self.connect_timeout, self.max_frame_size).await;
    }

    async fn reply(&self, hub_id: &str, env: Envelope) {
        let target = {
            let links = self.links.lock().unwrap();
            links.get(hub_id).map(|entry| (entry.host.clone(), entry.port))
        };
        if let Some((host, port)) = target {
            send_plain(&host, port, &env, self.connect_timeout, self.max_frame_size).await;
        }
    }

    pub fn is_remote(&self, node_id: &str) -> bool {
        self.hub_for(node_id).is_some()
    }

    pub fn hub_for(&self, node_id: &str) -> Option<String> {
        self.remote_devices
            .lock()
            .unwrap()
            .iter()
            .find(|(_, devices)| devices.iter().any(|d| d.node_id == node_id))
            .map(|(hub_id, _)| hub_id.clone())
    }

    pub fn list_remote(&self) -> Vec<RemoteDevice> {
        self.remote_devices.lock().unwrap().values().flatten().cloned().collect()
    }

    pub fn all_federated(&self) -> HashMap<String, Vec<RemoteDevice>> {
        self.remote_devices.lock().unwrap().clone()
    }

    pub fn list_hubs(&self) -> Vec<String> {
        self.links.lock().unwrap().keys().cloned().collect()
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}
