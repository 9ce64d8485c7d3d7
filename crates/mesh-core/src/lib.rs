//! Shared wire and data-model primitives for the mesh hub.
//!
//! Holds the envelope schema, dynamically-typed value model, peer record,
//! wall-clock helper, and the shared error type. Every other crate in the
//! workspace depends on this one.

pub mod clock;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod persist;
pub mod value;

pub use clock::now_secs;
pub use envelope::{Envelope, MessageType, BROADCAST_TARGET};
pub use error::MeshError;
pub use peer::Peer;
pub use persist::{load_json, load_json_or_default, restrict_permissions, save_json_atomic};
pub use value::{DeviceValue, Operator};
