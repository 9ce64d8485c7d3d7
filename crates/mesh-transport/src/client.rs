use std::sync::{Arc, Mutex};

use mesh_core::Envelope;
use mesh_crypto::{encrypt_payload, should_encrypt, AuthGuard, KeyStore};
use mesh_resilience::{retry_send, RetryPolicy};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::TransportConfig;
use crate::stream::DuplexStream;

/// A pinned mTLS client identity for dialing a specific peer. When present
/// on a [`SendContext`], `send` negotiates TLS and skips the HMAC/AEAD
/// envelope pipeline entirely for that connection — mTLS and PSK
/// authentication are alternative, not stacked, transports (spec §4.6,
/// §4.8 design note).
#[derive(Clone)]
pub struct TlsClientContext {
    pub config: Arc<rustls::ClientConfig>,
    /// SNI / certificate-verification name, normally the target's `node_id`
    /// (device certs carry `SAN = DnsName(node_id)`, not the dialed IP).
    pub server_name: String,
}

/// Everything [`send`] needs beyond the target address and the envelope
/// itself.
pub struct SendContext<'a> {
    pub keystore: &'a Mutex<KeyStore>,
    pub auth: &'a Mutex<AuthGuard>,
    pub encryption_enabled: bool,
    pub tls: Option<&'a TlsClientContext>,
    pub transport: &'a TransportConfig,
}

/// Encrypts (if applicable) and signs `env` for `target_host:target_port`,
/// opens a short-lived TCP (or mTLS) connection, writes the frame, and lets
/// the connection drop (spec §4.8).
///
/// A `false` return covers every failure mode — unresolved key, connect
/// timeout, refused connection, oversized frame; the cause is logged at
/// `debug` rather than surfaced, since a caller doing this inline within an
/// automation fan-out just needs to know whether to count it as delivered.
pub async fn send(target_host: &str, target_port: u16, mut env: Envelope, ctx: &SendContext<'_>) -> bool {
    let is_broadcast = env.is_broadcast();

    if ctx.tls.is_none() {
        let psk = { ctx.keystore.lock().unwrap().get(&env.target).map(str::to_string) };

        if should_encrypt(&env, ctx.encryption_enabled, is_broadcast) {
            let Some(psk) = psk.as_deref() else {
                debug!(target = %env.target, "transport: no key for target, skipping encrypted send");
                return false;
            };
            if let Err(err) = encrypt_payload(&mut env, psk) {
                debug!(error = %err, "transport: encryption failed");
                return false;
            }
        }

        let auth_enabled = ctx.auth.lock().unwrap().psk_auth_enabled;
        if auth_enabled {
            if let Some(psk) = psk.as_deref() {
                ctx.auth.lock().unwrap().sign(&mut env, psk);
            }
        }
    }

    let connected = tokio::time::timeout(ctx.transport.connect_timeout, TcpStream::connect((target_host, target_port))).await;
    let tcp_stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(error = %err, target_host, target_port, "transport: connect failed");
            return false;
        }
        Err(_) => {
            debug!(target_host, target_port, "transport: connect timed out");
            return false;
        }
    };

    let mut stream: Box<dyn DuplexStream> = match ctx.tls {
        Some(tls) => {
            let Ok(server_name) = ServerName::try_from(tls.server_name.clone()) else {
                debug!(name = %tls.server_name, "transport: invalid tls server name");
                return false;
            };
            let connector = TlsConnector::from(tls.config.clone());
            match tokio::time::timeout(ctx.transport.tls_handshake_timeout, connector.connect(server_name, tcp_stream)).await {
                Ok(Ok(tls_stream)) => Box::new(tls_stream),
                Ok(Err(err)) => {
                    debug!(error = %err, "transport: tls handshake failed");
                    return false;
                }
                Err(_) => {
                    debug!("transport: tls handshake timed out");
                    return false;
                }
            }
        }
        None => Box::new(tcp_stream),
    };

    match mesh_wire::write_envelope(&mut stream, &env, ctx.transport.max_frame_size).await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "transport: write failed");
            false
        }
    }
}

/// [`send`] retried under `policy` (spec §4.2, §4.8). `env` must be cloned
/// per attempt since a failed send may have partially consumed it (AEAD
/// encryption and signing are in-place).
pub async fn send_with_retry(target_host: &str, target_port: u16, env: Envelope, ctx: &SendContext<'_>, policy: RetryPolicy) -> bool {
    retry_send(|| send(target_host, target_port, env.clone(), ctx), policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::MessageType;
    use tokio::net::TcpListener;

    fn ctx<'a>(keystore: &'a Mutex<KeyStore>, auth: &'a Mutex<AuthGuard>, transport: &'a TransportConfig) -> SendContext<'a> {
        SendContext { keystore, auth, encryption_enabled: true, tls: None, transport }
    }

    #[tokio::test]
    async fn send_writes_a_signed_frame_to_a_real_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut keystore = KeyStore::load(dir.path().join("keys.json")).unwrap();
        let psk = keystore.add("esp32-kitchen", "Kitchen", 0.0).unwrap();
        let keystore = Mutex::new(keystore);
        let auth = Mutex::new(AuthGuard::default());

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = TransportConfig::new(addr.port());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            mesh_wire::read_envelope(&mut stream, config.max_frame_size).await
        });

        let config = TransportConfig::new(addr.port());
        let send_ctx = ctx(&keystore, &auth, &config);
        let env = Envelope::new(MessageType::Command, "hub", "esp32-kitchen", 10.0);
        assert!(send("127.0.0.1", addr.port(), env, &send_ctx).await);

        let received = server.await.unwrap().unwrap();
        assert!(received.is_signed());
        assert_eq!(received.source, "hub");
        let _ = psk;
    }

    #[tokio::test]
    async fn send_fails_closed_when_connect_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Mutex::new(KeyStore::load(dir.path().join("keys.json")).unwrap());
        let auth = Mutex::new(AuthGuard::default());
        let config = TransportConfig::new(0);
        let send_ctx = ctx(&keystore, &auth, &config);
        let env = Envelope::new(MessageType::Ping, "hub", "esp32-kitchen", 0.0);
        assert!(!send("127.0.0.1", 1, env, &send_ctx).await);
    }
}
