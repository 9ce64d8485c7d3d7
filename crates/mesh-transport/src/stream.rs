use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe union of a plain or TLS-wrapped duplex stream so the framing
/// and security pipeline in [`crate::server`] and [`crate::client`] doesn't
/// need to be generic over both.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}
