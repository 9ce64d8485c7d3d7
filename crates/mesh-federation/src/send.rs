use std::time::Duration;

use mesh_core::Envelope;
use tokio::net::TcpStream;
use tracing::debug;

/// Writes `env` over a fresh TCP connection to `host:port` and drops it.
///
/// Federation links authenticate by dialing a host/port the operator
/// configured (not by PSK/HMAC, spec §4.4's "federation's own
/// authentication policy"), so unlike [`mesh_transport::send`] this never
/// touches a `KeyStore` or `AuthGuard`.
pub async fn send_plain(host: &str, port: u16, env: &Envelope, connect_timeout: Duration, max_frame_size: usize) -> bool {
    let connected = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await;
    let mut stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(error = %err, host, port, "federation: connect failed");
            return false;
        }
        Err(_) => {
            debug!(host, port, "federation: connect timed out");
            return false;
        }
    };
    match mesh_wire::write_envelope(&mut stream, env, max_frame_size).await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "federation: write failed");
            false
        }
    }
}
