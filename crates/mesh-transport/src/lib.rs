//! TCP transport: the per-connection accept loop (authentication, AEAD
//! decryption, mTLS revocation enforcement) and the outbound send pipeline
//! (spec §4.8). Peer address resolution and inbound dispatch are handled by
//! callbacks the caller installs, so this crate never depends on discovery
//! or on the orchestrator directly (spec §9).

pub mod client;
pub mod config;
pub mod dispatch;
pub mod server;
pub mod stream;

pub use client::{send, send_with_retry, SendContext, TlsClientContext};
pub use config::{TransportConfig, DEFAULT_TCP_PORT};
pub use dispatch::{DispatchFuture, EnvelopeHandler, PinActiveCheck};
pub use server::{ServerError, TransportSecurity, TransportServer};
