//! UDP peer discovery: beacon broadcast/receive and the peer freshness
//! table (spec §4.7). Carries no trust — authentication lives in
//! `mesh-crypto`.

pub mod beacon;
pub mod service;
pub mod table;

pub use beacon::Beacon;
pub use service::{DiscoveryConfig, DiscoveryEvent, DiscoveryService, DEFAULT_BEACON_INTERVAL, DEFAULT_PEER_TIMEOUT, DEFAULT_UDP_PORT};
pub use table::PeerTable;
