//! `MeshChannel`: composes every crate in the workspace into the running
//! hub (spec §4.15, §9). Owns the transport server, the discovery
//! service, and every stateful component (keystore, registry, automation
//! engine, enrollment service, OTA manager, firmware store, federation
//! manager), and is the sole place that translates between wire
//! envelopes and each crate's native types.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_automation::AutomationEngine;
use mesh_core::{DeviceValue, Envelope, MessageType, Peer};
use mesh_crypto::{AuthGuard, CaError, CertificateAuthority, KeyStore};
use mesh_discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};
use mesh_enroll::EnrollmentService;
use mesh_federation::{FederationManager, LocalCommandExecutor, LocalDevicesSnapshot, RemoteDevice};
use mesh_ota::{FirmwareStore, OtaAction, OtaError, OtaManager};
use mesh_registry::{ActionKind, Command, DeviceRegistry, Response, ResponseStatus};
use mesh_resilience::{RetryPolicy, Watchdog};
use mesh_transport::{
    EnvelopeHandler, PinActiveCheck, SendContext, TlsClientContext, TransportConfig, TransportSecurity, TransportServer,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::federation_config::load_federation_peers;

/// Installed by the binary (or a future operator-facing surface) to
/// observe inbound `CHAT` messages (spec §4.15).
pub type ChatSink = Arc<dyn Fn(String, String) + Send + Sync>;
/// Installed to observe the outcome of every dispatched `Command`,
/// whether executed locally or forwarded across a federation link.
pub type CommandSink = Arc<dyn Fn(Command, Response) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("storage error: {0}")]
    Storage(#[from] mesh_core::MeshError),
    #[error("certificate authority error: {0}")]
    Ca(#[from] CaError),
    #[error("transport server failed to start: {0}")]
    Transport(#[from] mesh_transport::ServerError),
    #[error("discovery service failed to start: {0}")]
    Discovery(#[from] std::io::Error),
}

struct Inner {
    config: HubConfig,
    keystore: Arc<Mutex<KeyStore>>,
    auth: Arc<Mutex<AuthGuard>>,
    ca: Option<Arc<Mutex<CertificateAuthority>>>,
    registry: Mutex<DeviceRegistry>,
    automation: Mutex<AutomationEngine>,
    enrollment: Mutex<EnrollmentService>,
    ota: Mutex<OtaManager>,
    firmware: Mutex<FirmwareStore>,
    federation: FederationManager,
    discovery: Mutex<DiscoveryService>,
    transport: Mutex<Option<TransportServer>>,
    ota_watchdog: Mutex<Option<Watchdog>>,
    chat_sink: Mutex<Option<ChatSink>>,
    command_sink: Mutex<Option<CommandSink>>,
}

/// The hub's orchestrator (spec §4.15). Cheaply `Clone`: every field
/// lives behind the single `Arc<Inner>`, so closures captured by the
/// transport handler, the discovery callback, and the federation
/// executor all share one set of locks.
#[derive(Clone)]
pub struct MeshChannel(Arc<Inner>);

impl MeshChannel {
    pub fn new(config: HubConfig) -> Result<Self, ChannelError> {
        let keystore = Arc::new(Mutex::new(KeyStore::load(&config.key_store_path)?));
        let auth = Arc::new(Mutex::new(AuthGuard::new(config.nonce_window_seconds, config.allow_unauthenticated, config.psk_auth_enabled)));
        let ca = if config.mtls_enabled {
            Some(Arc::new(Mutex::new(CertificateAuthority::initialize(&config.ca_dir, config.device_cert_validity_days)?)))
        } else {
            None
        };
        let registry = Mutex::new(DeviceRegistry::load(&config.registry_path));
        let automation = Mutex::new(AutomationEngine::load(&config.automation_rules_path));
        let enrollment = Mutex::new(EnrollmentService::new(config.enrollment_pin_length));
        let ota = Mutex::new(OtaManager::new());
        let firmware = Mutex::new(FirmwareStore::open(&config.firmware_dir)?);
        let federation = FederationManager::new(config.node_id.clone(), Duration::from_secs(config.connect_timeout_secs), config.max_frame_size);

        let mut discovery_config = DiscoveryConfig::new(config.node_id.clone(), config.tcp_port);
        discovery_config.udp_port = config.udp_port;
        discovery_config.roles = config.roles.clone();
        discovery_config.device_type = config.device_type.clone();
        discovery_config.capabilities = config.capabilities.clone();
        let discovery = Mutex::new(DiscoveryService::new(discovery_config));

        Ok(Self(Arc::new(Inner {
            config,
            keystore,
            auth,
            ca,
            registry,
            automation,
            enrollment,
            ota,
            firmware,
            federation,
            discovery,
            transport: Mutex::new(None),
            ota_watchdog: Mutex::new(None),
            chat_sink: Mutex::new(None),
            command_sink: Mutex::new(None),
        })))
    }

    pub fn on_chat(&self, sink: impl Fn(String, String) + Send + Sync + 'static) {
        *self.0.chat_sink.lock().unwrap() = Some(Arc::new(sink));
    }

    pub fn on_command_result(&self, sink: impl Fn(Command, Response) + Send + Sync + 'static) {
        *self.0.command_sink.lock().unwrap() = Some(Arc::new(sink));
    }

    /// Starts every subsystem in dependency order: transport server,
    /// discovery beaconing, federation links, and the OTA timeout
    /// watchdog (spec §4.15).
    pub async fn start(&self) -> Result<(), ChannelError> {
        if let Some(ca) = &self.0.ca {
            self.ensure_hub_client_identity(&ca.lock().unwrap());
        }

        let transport_config = self.transport_config();
        let security = TransportSecurity {
            keystore: self.0.keystore.clone(),
            auth: self.0.auth.clone(),
            ca: self.0.ca.clone(),
            encryption_enabled: self.0.config.encryption_enabled,
        };
        let handler: EnvelopeHandler = {
            let channel = self.clone();
            Arc::new(move |env: Envelope| {
                let channel = channel.clone();
                Box::pin(async move { channel.dispatch(env).await })
            })
        };
        let pin_active: PinActiveCheck = {
            let channel = self.clone();
            Arc::new(move || channel.enrollment_active())
        };
        let server = TransportServer::start(transport_config, security, handler, pin_active).await?;
        *self.0.transport.lock().unwrap() = Some(server);

        {
            let discovery = self.0.discovery.lock().unwrap();
            let channel = self.clone();
            discovery.on_event(move |event| channel.handle_discovery_event(event));
        }
        {
            // Held across the startup await: this runs once, before any
            // other caller could contend for the lock.
            let mut discovery = self.0.discovery.lock().unwrap();
            discovery.start().await?;
        }

        let local_command: LocalCommandExecutor = {
            let channel = self.clone();
            Arc::new(move |node_id: String, capability: String, value: DeviceValue| {
                let channel = channel.clone();
                Box::pin(async move { channel.execute_local_command(node_id, capability, value).await })
            })
        };
        let local_devices: LocalDevicesSnapshot = {
            let channel = self.clone();
            Arc::new(move || channel.local_devices_snapshot())
        };
        let federation_config = load_federation_peers(&self.0.config.federation_config_path);
        let sync_interval = Duration::from_secs(federation_config.sync_interval_secs.unwrap_or(self.0.config.federation_sync_interval_secs));
        self.0.federation.start(federation_config.peers, sync_interval, local_command, local_devices);

        let ota_watchdog = {
            let channel = self.clone();
            Watchdog::start(Duration::from_secs(5), move || {
                let channel = channel.clone();
                async move {
                    channel.run_ota_maintenance().await;
                    Ok(())
                }
            })
        };
        *self.0.ota_watchdog.lock().unwrap() = Some(ota_watchdog);

        info!(node_id = %self.0.config.node_id, tcp_port = self.0.config.tcp_port, "channel: started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(mut server) = self.0.transport.lock().unwrap().take() {
            server.stop();
        }
        self.0.discovery.lock().unwrap().stop();
        if let Some(mut watchdog) = self.0.ota_watchdog.lock().unwrap().take() {
            watchdog.stop();
        }
        self.0.federation.stop();
        info!("channel: stopped");
    }

    pub fn begin_enrollment(&self) -> String {
        self.0.enrollment.lock().unwrap().create_pin(self.0.config.enrollment_pin_timeout, self.0.config.enrollment_max_attempts, mesh_core::now_secs())
    }

    pub fn cancel_enrollment(&self) {
        self.0.enrollment.lock().unwrap().cancel_pin();
    }

    pub fn registry_summary(&self) -> String {
        self.0.registry.lock().unwrap().summary_text()
    }

    /// Operator/API-triggered firmware push (spec §4.13 step 1), outside
    /// the inbound-dispatch table.
    pub async fn offer_firmware(&self, node_id: &str, firmware_id: &str) -> Result<(), OtaError> {
        let action = {
            let mut ota = self.0.ota.lock().unwrap();
            let firmware = self.0.firmware.lock().unwrap();
            ota.start(node_id, firmware_id, &firmware, mesh_core::now_secs())?
        };
        self.send_ota_action(action).await;
        Ok(())
    }

    // ---- inbound dispatch (spec §4.15) ----

    /// Dispatches one inbound envelope and returns the reply (if any) to be
    /// written back on the same connection before it closes (spec §4.8
    /// single-shot semantics). Sends that target a *different* node than
    /// `env.source` — forwarding a command to a device, pushing an OTA
    /// chunk on a timer, broadcasting automation actions — go out through
    /// `send_to_device`'s discovery-routed dial instead, since those aren't
    /// replies to the connection currently being read.
    async fn dispatch(&self, env: Envelope) -> Option<Envelope> {
        let now = mesh_core::now_secs();
        match env.kind {
            MessageType::Chat => {
                self.dispatch_chat(env);
                None
            }
            MessageType::StateReport => {
                self.dispatch_state_report(env, now).await;
                None
            }
            MessageType::Command | MessageType::Response => self.dispatch_command_or_response(env, now).await,
            MessageType::EnrollRequest => Some(self.dispatch_enroll_request(env, now)),
            MessageType::Ping => Some(self.dispatch_ping(env, now)),
            MessageType::Pong => None,
            MessageType::OtaAccept | MessageType::OtaReject | MessageType::OtaChunkAck | MessageType::OtaVerify | MessageType::OtaAbort => {
                self.dispatch_ota(env, now)
            }
            MessageType::FederationHello
            | MessageType::FederationSync
            | MessageType::FederationCommand
            | MessageType::FederationResponse
            | MessageType::FederationState
            | MessageType::FederationPing
            | MessageType::FederationPong => {
                let executor = self.local_command_executor();
                self.0.federation.handle(env, &executor).await;
                None
            }
            MessageType::EnrollResponse | MessageType::OtaOffer | MessageType::OtaComplete => {
                debug!(kind = ?env.kind, source = %env.source, "channel: ignoring hub-originated message type received inbound");
                None
            }
        }
    }

    fn dispatch_chat(&self, env: Envelope) {
        let text = env.payload.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
        if let Some(sink) = self.0.chat_sink.lock().unwrap().clone() {
            sink(env.source, text);
        } else {
            debug!(source = %env.source, "channel: chat received with no sink installed");
        }
    }

    async fn dispatch_state_report(&self, env: Envelope, now: f64) {
        let Some(state) = env.payload.get("state").and_then(Value::as_object).cloned() else {
            debug!(source = %env.source, "channel: STATE_REPORT missing state object");
            return;
        };
        {
            let mut registry = self.0.registry.lock().unwrap();
            if let Err(err) = registry.update_state(&env.source, &state) {
                warn!(error = %err, source = %env.source, "channel: failed to persist state update");
                return;
            }
        }
        let commands = {
            let mut automation = self.0.automation.lock().unwrap();
            let registry = self.0.registry.lock().unwrap();
            automation.evaluate(&env.source, &registry, now)
        };
        for command in commands {
            let target = command.device.clone();
            let command_env = mesh_registry::to_envelope(&command, &self.0.config.node_id, now);
            self.send_to_device(&target, command_env, true).await;
        }
        let snapshot = {
            let registry = self.0.registry.lock().unwrap();
            registry.get(&env.source).and_then(|device| serde_json::to_value(&device.state).ok()).and_then(|value| value.as_object().cloned())
        };
        if let Some(state) = snapshot {
            self.0.federation.broadcast_state(&env.source, state);
        }
    }

    async fn dispatch_command_or_response(&self, env: Envelope, now: f64) -> Option<Envelope> {
        if env.kind == MessageType::Response {
            self.dispatch_inbound_response(env);
            return None;
        }
        let Some(command) = mesh_registry::from_envelope(&env) else {
            debug!(source = %env.source, "channel: COMMAND envelope failed to decode");
            return None;
        };
        let response = if self.0.federation.is_remote(&command.device) {
            self.forward_remote_command(&command).await
        } else {
            self.validate_and_forward_local(&command, now).await
        };
        if let Some(sink) = self.0.command_sink.lock().unwrap().clone() {
            sink(command, response.clone());
        }
        Some(mesh_registry::response_to_envelope(&response, &self.0.config.node_id, &env.source, now))
    }

    fn dispatch_inbound_response(&self, env: Envelope) {
        let Ok(response) = serde_json::from_value::<Response>(Value::Object(env.payload.clone())) else {
            debug!(source = %env.source, "channel: RESPONSE envelope failed to decode");
            return;
        };
        if let Some(sink) = self.0.command_sink.lock().unwrap().clone() {
            let command = Command { device: response.device.clone(), action_kind: ActionKind::Get, capability: response.capability.clone(), params: Map::new() };
            sink(command, response);
        } else {
            debug!(source = %env.source, "channel: response received with no sink installed");
        }
    }

    async fn forward_remote_command(&self, command: &Command) -> Response {
        let hub = self.0.federation.hub_for(&command.device);
        let value = command.params.get("value").cloned().and_then(|v| serde_json::from_value::<DeviceValue>(v).ok());
        match (hub, command.capability.clone(), value) {
            (Some(hub), Some(capability), Some(value)) => self
                .0
                .federation
                .forward_command(&hub, &command.device, &capability, value)
                .await
                .unwrap_or_else(|| Response {
                    device: command.device.clone(),
                    status: ResponseStatus::Error,
                    capability: Some(capability),
                    value: None,
                    error: Some("federation command timed out".to_string()),
                }),
            _ => Response {
                device: command.device.clone(),
                status: ResponseStatus::Error,
                capability: command.capability.clone(),
                value: None,
                error: Some("federated commands require a capability and a value".to_string()),
            },
        }
    }

    fn dispatch_enroll_request(&self, env: Envelope, now: f64) -> Envelope {
        let name = env.payload.get("name").and_then(Value::as_str).unwrap_or(&env.source).to_string();
        let pin_proof = env.payload.get("pin_proof").and_then(Value::as_str).unwrap_or_default().to_string();
        let result = {
            let mut enrollment = self.0.enrollment.lock().unwrap();
            let mut keystore = self.0.keystore.lock().unwrap();
            let ca_guard = self.0.ca.as_ref().map(|ca| ca.lock().unwrap());
            enrollment.handle_request(&env.source, &name, &pin_proof, &mut keystore, ca_guard.as_deref(), now)
        };
        let mut reply = Envelope::new(MessageType::EnrollResponse, self.0.config.node_id.clone(), env.source.clone(), now);
        reply.payload = serde_json::to_value(&result).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default();
        reply
    }

    fn dispatch_ping(&self, env: Envelope, now: f64) -> Envelope {
        Envelope::new(MessageType::Pong, self.0.config.node_id.clone(), env.source.clone(), now)
    }

    fn dispatch_ota(&self, env: Envelope, now: f64) -> Option<Envelope> {
        let node_id = env.source.clone();
        let firmware_id = env.payload.get("firmware_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let action = {
            let mut ota = self.0.ota.lock().unwrap();
            let firmware = self.0.firmware.lock().unwrap();
            match env.kind {
                MessageType::OtaAccept => ota.handle_accept(&node_id, &firmware_id, &firmware, now),
                MessageType::OtaChunkAck => {
                    let seq = env.payload.get("seq").and_then(Value::as_u64).unwrap_or(0);
                    ota.handle_chunk_ack(&node_id, &firmware_id, seq, &firmware, now)
                }
                MessageType::OtaVerify => {
                    let sha256 = env.payload.get("sha256").and_then(Value::as_str).unwrap_or_default();
                    ota.handle_verify(&node_id, &firmware_id, sha256, now)
                }
                MessageType::OtaReject => {
                    let reason = env.payload.get("reason").and_then(Value::as_str).unwrap_or("rejected");
                    ota.handle_reject(&node_id, &firmware_id, reason, now);
                    None
                }
                MessageType::OtaAbort => {
                    let reason = env.payload.get("reason").and_then(Value::as_str).unwrap_or("device_abort");
                    ota.handle_device_abort(&node_id, &firmware_id, reason, now);
                    None
                }
                _ => None,
            }
        };
        action.map(|action| self.build_ota_envelope(action, now).1)
    }

    async fn run_ota_maintenance(&self) {
        let now = mesh_core::now_secs();
        let actions = {
            let mut ota = self.0.ota.lock().unwrap();
            let actions = ota.check_timeouts(now, self.0.config.ota_offer_timeout, self.0.config.ota_chunk_ack_timeout, self.0.config.ota_verify_timeout);
            ota.garbage_collect(now);
            actions
        };
        for action in actions {
            self.send_ota_action(action).await;
        }
    }

    /// Pushes an OTA-driven send outside the current dispatch (operator
    /// firmware offers, the timeout/garbage-collection sweep): these
    /// target a device that isn't the connection currently being read, so
    /// they go out through the discovery-routed dial rather than as a
    /// same-connection reply.
    async fn send_ota_action(&self, action: OtaAction) {
        let now = mesh_core::now_secs();
        let (node_id, env) = self.build_ota_envelope(action, now);
        self.send_to_device(&node_id, env, true).await;
    }

    fn build_ota_envelope(&self, action: OtaAction, now: f64) -> (String, Envelope) {
        match action {
            OtaAction::Offer { node_id, firmware_id, version, size, sha256, chunk_size } => {
                let mut env = Envelope::new(MessageType::OtaOffer, self.0.config.node_id.clone(), node_id.clone(), now);
                env.payload.insert("firmware_id".to_string(), Value::String(firmware_id));
                env.payload.insert("version".to_string(), Value::String(version));
                env.payload.insert("size".to_string(), Value::from(size));
                env.payload.insert("sha256".to_string(), Value::String(sha256));
                env.payload.insert("chunk_size".to_string(), Value::from(chunk_size as u64));
                (node_id, env)
            }
            OtaAction::Chunk { node_id, seq, data_base64, total } => {
                let mut env = Envelope::new(MessageType::OtaChunk, self.0.config.node_id.clone(), node_id.clone(), now);
                env.payload.insert("seq".to_string(), Value::from(seq));
                env.payload.insert("data".to_string(), Value::String(data_base64));
                env.payload.insert("total".to_string(), Value::from(total));
                (node_id, env)
            }
            OtaAction::Complete { node_id } => {
                let env = Envelope::new(MessageType::OtaComplete, self.0.config.node_id.clone(), node_id.clone(), now);
                (node_id, env)
            }
            OtaAction::Abort { node_id, reason } => {
                let mut env = Envelope::new(MessageType::OtaAbort, self.0.config.node_id.clone(), node_id.clone(), now);
                env.payload.insert("reason".to_string(), Value::String(reason));
                (node_id, env)
            }
        }
    }

    // ---- discovery-driven auto-registration (spec §4.7, §4.10) ----

    fn handle_discovery_event(&self, event: &DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerSeen(peer) => self.handle_peer_seen(peer),
            DiscoveryEvent::PeerLost(node_id) => self.handle_peer_lost(node_id),
        }
    }

    fn handle_peer_seen(&self, peer: &Peer) {
        let mut registry = self.0.registry.lock().unwrap();
        if registry.get(&peer.node_id).is_some() {
            if let Err(err) = registry.mark_online(&peer.node_id, true, peer.last_seen) {
                warn!(error = %err, node_id = %peer.node_id, "channel: failed to mark peer online");
            }
            return;
        }
        let (Some(device_type), Some(capability_names)) = (peer.device_type.clone(), peer.capabilities.clone()) else {
            debug!(node_id = %peer.node_id, "channel: peer lacks device_type/capabilities, skipping auto-registration");
            return;
        };
        let mut device = mesh_registry::DeviceInfo::new(peer.node_id.clone(), device_type.clone(), peer.node_id.clone(), peer.last_seen);
        device.online = true;
        for name in capability_names {
            device.capabilities.push(mesh_registry::DeviceCapability::new(name, mesh_registry::CapabilityKind::Property, mesh_registry::DataType::String));
        }
        if let Err(err) = registry.register(device) {
            warn!(error = %err, node_id = %peer.node_id, "channel: auto-registration failed");
        } else {
            info!(node_id = %peer.node_id, device_type, "channel: auto-registered device from discovery beacon");
        }
    }

    fn handle_peer_lost(&self, node_id: &str) {
        let mut registry = self.0.registry.lock().unwrap();
        if let Err(err) = registry.mark_online(node_id, false, mesh_core::now_secs()) {
            warn!(error = %err, node_id, "channel: failed to mark peer offline");
        }
    }

    // ---- federation callbacks (spec §4.14, §9 opaque-handle pattern) ----

    fn local_command_executor(&self) -> LocalCommandExecutor {
        let channel = self.clone();
        Arc::new(move |node_id: String, capability: String, value: DeviceValue| {
            let channel = channel.clone();
            Box::pin(async move { channel.execute_local_command(node_id, capability, value).await })
        })
    }

    async fn execute_local_command(&self, node_id: String, capability: String, value: DeviceValue) -> Response {
        let known = self.0.registry.lock().unwrap().get(&node_id).is_some();
        if !known {
            return Response { device: node_id, status: ResponseStatus::Error, capability: Some(capability), value: None, error: Some("unknown device".to_string()) };
        }
        let mut params = Map::new();
        params.insert("value".to_string(), serde_json::to_value(&value).unwrap_or(Value::Null));
        let command = Command { device: node_id, action_kind: ActionKind::Set, capability: Some(capability), params };
        self.validate_and_forward_local(&command, mesh_core::now_secs()).await
    }

    async fn validate_and_forward_local(&self, command: &Command, now: f64) -> Response {
        let issues = {
            let registry = self.0.registry.lock().unwrap();
            mesh_registry::validate(command, &registry)
        };
        if mesh_registry::has_blocking_error(&issues) {
            let reason = issues.into_iter().find(|issue| issue.severity == mesh_registry::Severity::Error).map(|issue| issue.message).unwrap_or_default();
            return Response { device: command.device.clone(), status: ResponseStatus::Error, capability: command.capability.clone(), value: None, error: Some(reason) };
        }
        let env = mesh_registry::to_envelope(command, &self.0.config.node_id, now);
        if self.send_to_device(&command.device, env, true).await {
            Response { device: command.device.clone(), status: ResponseStatus::Ok, capability: command.capability.clone(), value: None, error: None }
        } else {
            Response { device: command.device.clone(), status: ResponseStatus::Error, capability: command.capability.clone(), value: None, error: Some("send failed".to_string()) }
        }
    }

    fn local_devices_snapshot(&self) -> Vec<RemoteDevice> {
        let registry = self.0.registry.lock().unwrap();
        registry
            .all()
            .into_iter()
            .map(|device| RemoteDevice {
                node_id: device.node_id.clone(),
                device_type: Some(device.device_type.clone()),
                name: device.display_name.clone(),
                online: device.online,
                state: serde_json::to_value(&device.state).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default(),
                capabilities: device.capabilities.iter().map(|c| c.name.clone()).collect(),
            })
            .collect()
    }

    // ---- outbound transport plumbing (spec §4.8) ----

    async fn send_to_device(&self, node_id: &str, env: Envelope, retry: bool) -> bool {
        let Some(peer) = self.0.discovery.lock().unwrap().get(node_id) else {
            debug!(node_id, "channel: no known route for outbound send, dropping");
            return false;
        };
        let transport_config = self.transport_config();
        let tls = self.client_tls_context(node_id);
        let ctx = SendContext {
            keystore: &self.0.keystore,
            auth: &self.0.auth,
            encryption_enabled: self.0.config.encryption_enabled,
            tls: tls.as_ref(),
            transport: &transport_config,
        };
        if retry {
            mesh_transport::send_with_retry(&peer.host, peer.port, env, &ctx, RetryPolicy::default_critical()).await
        } else {
            mesh_transport::send(&peer.host, peer.port, env, &ctx).await
        }
    }

    fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(self.0.config.tcp_port);
        config.tls_enabled = self.0.config.mtls_enabled;
        config.max_frame_size = self.0.config.max_frame_size;
        config.connect_timeout = Duration::from_secs(self.0.config.connect_timeout_secs);
        config.frame_read_timeout = Duration::from_secs(self.0.config.frame_read_timeout_secs);
        config.tls_handshake_timeout = Duration::from_secs(self.0.config.tls_handshake_timeout_secs);
        config
    }

    /// `create_client_tls_context` only reads the hub's own device
    /// identity under `ca_dir/devices/<node_id>`, never `hub.crt`/
    /// `hub.key`; this lazily self-issues that identity the first time
    /// the hub needs to dial out over mTLS.
    fn ensure_hub_client_identity(&self, ca: &CertificateAuthority) {
        let cert_path = self.0.config.ca_dir.join("devices").join(format!("{}.crt", self.0.config.node_id));
        if Path::new(&cert_path).exists() {
            return;
        }
        if let Err(err) = ca.issue_device_cert(&self.0.config.node_id) {
            warn!(error = %err, "channel: failed to issue the hub's own client identity");
        }
    }

    fn client_tls_context(&self, target_node_id: &str) -> Option<TlsClientContext> {
        if !self.0.config.mtls_enabled {
            return None;
        }
        let ca_lock = self.0.ca.as_ref()?;
        let ca = ca_lock.lock().unwrap();
        match ca.create_client_tls_context(&self.0.config.node_id) {
            Ok(config) => Some(TlsClientContext { config, server_name: target_node_id.to_string() }),
            Err(err) => {
                debug!(error = %err, "channel: no client tls identity available, falling back to unencrypted send");
                None
            }
        }
    }

    fn enrollment_active(&self) -> bool {
        self.0.enrollment.lock().unwrap().is_active(mesh_core::now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    fn test_config(dir: &std::path::Path) -> HubConfig {
        HubConfig {
            node_id: "hub-test".to_string(),
            tcp_port: 0,
            udp_port: 0,
            key_store_path: dir.join("keys.json"),
            registry_path: dir.join("registry.json"),
            automation_rules_path: dir.join("rules.json"),
            firmware_dir: dir.join("firmware"),
            federation_config_path: dir.join("federation.json"),
            ca_dir: dir.join("ca"),
            ..HubConfig::default()
        }
    }

    #[test]
    fn new_channel_starts_with_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MeshChannel::new(test_config(dir.path())).unwrap();
        assert!(channel.registry_summary().contains("# Devices"));
    }

    #[test]
    fn begin_enrollment_activates_a_pin() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MeshChannel::new(test_config(dir.path())).unwrap();
        let pin = channel.begin_enrollment();
        assert_eq!(pin.len(), channel.0.config.enrollment_pin_length as usize);
        assert!(channel.enrollment_active());
        channel.cancel_enrollment();
        assert!(!channel.enrollment_active());
    }

    #[tokio::test]
    async fn dispatch_chat_invokes_the_installed_sink() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MeshChannel::new(test_config(dir.path())).unwrap();
        let received = StdArc::new(StdMutex::new(None));
        let received_clone = received.clone();
        channel.on_chat(move |source, text| {
            *received_clone.lock().unwrap() = Some((source, text));
        });

        let mut env = Envelope::new(MessageType::Chat, "esp32-kitchen", "hub-test", 0.0);
        env.payload.insert("text".to_string(), Value::String("hello".to_string()));
        channel.dispatch(env).await;

        let got = received.lock().unwrap().clone().unwrap();
        assert_eq!(got.0, "esp32-kitchen");
        assert_eq!(got.1, "hello");
    }

    #[tokio::test]
    async fn dispatch_command_for_unknown_device_reports_error_without_sending() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MeshChannel::new(test_config(dir.path())).unwrap();
        let seen = StdArc::new(StdMutex::new(None));
        let seen_clone = seen.clone();
        channel.on_command_result(move |_cmd, response| {
            *seen_clone.lock().unwrap() = Some(response);
        });

        let command = Command { device: "ghost".to_string(), action_kind: ActionKind::Get, capability: None, params: Map::new() };
        let env = mesh_registry::to_envelope(&command, "operator", 0.0);
        let reply = channel.dispatch(env).await;

        let response = seen.lock().unwrap().clone().unwrap();
        assert_eq!(response.status, ResponseStatus::Error);

        // The caller gets the same verdict back over the connection it used.
        let reply = reply.expect("command dispatch always replies");
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.target, "operator");
    }

    #[tokio::test]
    async fn ping_and_enroll_request_reply_directly_without_a_discovery_route() {
        // Neither "esp32-kitchen" below has ever sent a beacon, so a reply
        // routed through `send_to_device`'s discovery lookup would be
        // silently dropped; dispatch must hand the reply straight back
        // instead of trying to dial out.
        let dir = tempfile::tempdir().unwrap();
        let channel = MeshChannel::new(test_config(dir.path())).unwrap();

        let ping = Envelope::new(MessageType::Ping, "esp32-kitchen", "hub-test", 0.0);
        let pong = channel.dispatch(ping).await.expect("ping always gets a pong");
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.target, "esp32-kitchen");

        let pin = channel.begin_enrollment();
        let proof = mesh_enroll::compute_pin_proof(&pin, "esp32-kitchen");
        let mut request = Envelope::new(MessageType::EnrollRequest, "esp32-kitchen", "hub-test", 0.0);
        request.payload.insert("pin_proof".to_string(), Value::String(proof));
        let reply = channel.dispatch(request).await.expect("enroll request always gets a response");
        assert_eq!(reply.kind, MessageType::EnrollResponse);
        assert_eq!(reply.payload.get("status").and_then(Value::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn state_report_for_unregistered_device_is_silently_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let channel = MeshChannel::new(test_config(dir.path())).unwrap();
        let mut partial = Map::new();
        partial.insert("temperature".to_string(), Value::from(21.0));
        let mut env = Envelope::new(MessageType::StateReport, "esp32-kitchen", "hub-test", 0.0);
        env.payload.insert("state".to_string(), Value::Object(partial));
        channel.dispatch(env).await;
        assert!(channel.0.registry.lock().unwrap().get("esp32-kitchen").is_none());
    }
}
