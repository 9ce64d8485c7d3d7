//! Hub-to-hub federation: persistent links, registry sync, and
//! command/response forwarding across hubs (spec §4.14).

pub mod link;
pub mod manager;
pub mod send;
pub mod types;

pub use link::{HubLinkConfig, HubLinkHandle};
pub use manager::{FederationManager, LocalCommandExecutor, LocalDevicesSnapshot, DEFAULT_COMMAND_TIMEOUT, DEFAULT_SYNC_INTERVAL};
pub use send::send_plain;
pub use types::{FederationPeerConfig, RemoteDevice};
