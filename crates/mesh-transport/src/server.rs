use std::sync::{Arc, Mutex};

use mesh_core::MessageType;
use mesh_crypto::{decrypt_payload, AuthGuard, CertificateAuthority, KeyStore};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::dispatch::{EnvelopeHandler, PinActiveCheck};
use crate::stream::DuplexStream;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("tls context setup failed: {0}")]
    Tls(String),
}

/// Shared security state for the accept loop. Cloning shares the same
/// underlying locks, not a snapshot — a revocation recorded through the
/// owner's `Arc<Mutex<CertificateAuthority>>` is visible to every in-flight
/// connection handler immediately.
#[derive(Clone)]
pub struct TransportSecurity {
    pub keystore: Arc<Mutex<KeyStore>>,
    pub auth: Arc<Mutex<AuthGuard>>,
    pub ca: Option<Arc<Mutex<CertificateAuthority>>>,
    pub encryption_enabled: bool,
}

/// The TCP (optionally mTLS) accept loop (spec §4.8).
///
/// When `config.tls_enabled`, every connection is required to present a
/// client certificate signed by `security.ca`; the connection is dropped if
/// the peer's `CN` is revoked, and the HMAC/AEAD envelope pipeline is
/// skipped entirely for that connection (mTLS supersedes PSK
/// authentication, it doesn't stack with it).
pub struct TransportServer {
    accept_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TransportServer {
    pub async fn start(
        config: TransportConfig,
        security: TransportSecurity,
        handler: EnvelopeHandler,
        enroll_pin_active: PinActiveCheck,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;

        let tls_acceptor = if config.tls_enabled {
            let ca = security.ca.clone().ok_or_else(|| ServerError::Tls("tls_enabled requires a certificate authority".to_string()))?;
            let server_config = ca.lock().unwrap().create_server_tls_context().map_err(|err| ServerError::Tls(err.to_string()))?;
            Some(TlsAcceptor::from(server_config))
        } else {
            None
        };

        let accept_handle = tokio::spawn(accept_loop(listener, config, security, tls_acceptor, handler, enroll_pin_active));
        Ok(Self { accept_handle: Some(accept_handle) })
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TransportConfig,
    security: TransportSecurity,
    tls_acceptor: Option<TlsAcceptor>,
    handler: EnvelopeHandler,
    enroll_pin_active: PinActiveCheck,
) {
    loop {
        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "transport: accept failed");
                continue;
            }
        };
        let config = config.clone();
        let security = security.clone();
        let handler = handler.clone();
        let enroll_pin_active = enroll_pin_active.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            handle_accepted(tcp_stream, peer_addr, config, security, tls_acceptor, handler, enroll_pin_active).await;
        });
    }
}

async fn handle_accepted(
    tcp_stream: TcpStream,
    peer_addr: std::net::SocketAddr,
    config: TransportConfig,
    security: TransportSecurity,
    tls_acceptor: Option<TlsAcceptor>,
    handler: EnvelopeHandler,
    enroll_pin_active: PinActiveCheck,
) {
    let (stream, mtls_peer_node_id): (Box<dyn DuplexStream>, Option<String>) = match tls_acceptor {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(config.tls_handshake_timeout, acceptor.accept(tcp_stream));
            match handshake.await {
                Ok(Ok(tls_stream)) => {
                    let node_id = tls_stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .and_then(CertificateAuthority::peer_node_id_from_connection);
                    (Box::new(tls_stream), node_id)
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer_addr, error = %err, "transport: tls handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer_addr, "transport: tls handshake timed out");
                    return;
                }
            }
        }
        None => (Box::new(tcp_stream), None),
    };

    if let Some(node_id) = &mtls_peer_node_id {
        let revoked = security.ca.as_ref().map(|ca| ca.lock().unwrap().is_revoked(node_id)).unwrap_or(false);
        if revoked {
            debug!(node_id, "transport: dropping connection from revoked peer");
            return;
        }
    }

    read_and_dispatch(stream, config, security, mtls_peer_node_id, handler, enroll_pin_active).await;
}

async fn read_and_dispatch(
    mut stream: Box<dyn DuplexStream>,
    config: TransportConfig,
    security: TransportSecurity,
    mtls_peer_node_id: Option<String>,
    handler: EnvelopeHandler,
    enroll_pin_active: PinActiveCheck,
) {
    loop {
        let read = tokio::time::timeout(config.frame_read_timeout, mesh_wire::read_envelope(&mut stream, config.max_frame_size));
        let Ok(Some(mut env)) = read.await else {
            return;
        };

        if mtls_peer_node_id.is_none() {
            let now = mesh_core::now_secs();
            let pin_active = enroll_pin_active();
            let verified = {
                let keystore = security.keystore.lock().unwrap();
                let mut auth = security.auth.lock().unwrap();
                auth.verify(&env, &keystore, now, pin_active)
            };
            if !verified {
                debug!(source = %env.source, "transport: dropping unauthenticated envelope");
                continue;
            }
            if env.is_encrypted() {
                let keystore = security.keystore.lock().unwrap();
                if let Err(err) = decrypt_payload(&mut env, &keystore) {
                    debug!(error = %err, source = %env.source, "transport: dropping undecryptable envelope");
                    continue;
                }
            }
        }

        let is_federation_link = matches!(
            env.kind,
            MessageType::FederationHello
                | MessageType::FederationSync
                | MessageType::FederationState
                | MessageType::FederationCommand
                | MessageType::FederationResponse
                | MessageType::FederationPing
                | MessageType::FederationPong
        );
        let source = env.source.clone();
        if let Some(reply) = handler(env).await {
            if let Err(err) = mesh_wire::write_envelope(&mut stream, &reply, config.max_frame_size).await {
                debug!(error = %err, target = %source, "transport: failed to write reply, closing connection");
                return;
            }
        }
        if !is_federation_link {
            // Single-shot semantics: every non-federation connection carries
            // exactly one request and (optionally) its reply.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{Envelope, MessageType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpStream as ClientStream;

    fn no_pin() -> PinActiveCheck {
        Arc::new(|| false)
    }

    #[tokio::test]
    async fn accepts_and_dispatches_a_signed_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let mut keystore = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let psk = keystore.add("esp32-kitchen", "Kitchen", 0.0).unwrap();
        let security = TransportSecurity {
            keystore: Arc::new(Mutex::new(keystore)),
            auth: Arc::new(Mutex::new(AuthGuard::default())),
            ca: None,
            encryption_enabled: true,
        };

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let handler: EnvelopeHandler = Arc::new(move |_env| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
                None
            })
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = TransportConfig::new(addr.port());
        let mut server = TransportServer::start(config.clone(), security, handler, no_pin()).await.unwrap();

        let mut env = Envelope::new(MessageType::Ping, "esp32-kitchen", "hub", mesh_core::now_secs());
        AuthGuard::default().sign(&mut env, &psk);
        let mut stream = ClientStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        mesh_wire::write_envelope(&mut stream, &env, config.max_frame_size).await.unwrap();
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        server.stop();
    }

    #[tokio::test]
    async fn handler_reply_is_written_back_on_the_same_connection_then_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut keystore = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let psk = keystore.add("esp32-kitchen", "Kitchen", 0.0).unwrap();
        let security = TransportSecurity {
            keystore: Arc::new(Mutex::new(keystore)),
            auth: Arc::new(Mutex::new(AuthGuard::default())),
            ca: None,
            encryption_enabled: false,
        };

        let handler: EnvelopeHandler = Arc::new(move |env| {
            Box::pin(async move { Some(Envelope::new(MessageType::Pong, "hub", env.source, mesh_core::now_secs())) })
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = TransportConfig::new(addr.port());
        let mut server = TransportServer::start(config.clone(), security, handler, no_pin()).await.unwrap();

        let mut env = Envelope::new(MessageType::Ping, "esp32-kitchen", "hub", mesh_core::now_secs());
        AuthGuard::default().sign(&mut env, &psk);
        let mut stream = ClientStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        mesh_wire::write_envelope(&mut stream, &env, config.max_frame_size).await.unwrap();

        let reply = mesh_wire::read_envelope(&mut stream, config.max_frame_size).await.expect("reply envelope");
        assert_eq!(reply.kind, MessageType::Pong);
        assert_eq!(reply.target, "esp32-kitchen");

        // Single-shot semantics: the hub closes after one request/reply pair.
        let second_read = mesh_wire::read_envelope(&mut stream, config.max_frame_size).await;
        assert!(second_read.is_none());

        server.stop();
    }

    #[tokio::test]
    async fn unauthenticated_envelope_is_dropped_not_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let security = TransportSecurity {
            keystore: Arc::new(Mutex::new(keystore)),
            auth: Arc::new(Mutex::new(AuthGuard::default())),
            ca: None,
            encryption_enabled: true,
        };

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let handler: EnvelopeHandler = Arc::new(move |_env| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.fetch_add(1, Ordering::SeqCst);
                None
            })
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = TransportConfig::new(addr.port());

        let mut server = TransportServer::start(config.clone(), security, handler, no_pin()).await.unwrap();

        let env = Envelope::new(MessageType::Chat, "unknown-device", "hub", mesh_core::now_secs());
        let mut stream = ClientStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        mesh_wire::write_envelope(&mut stream, &env, config.max_frame_size).await.unwrap();
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
        server.stop();
    }
}
