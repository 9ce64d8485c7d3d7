//! Length-framed JSON wire protocol and canonical signing input (spec §4.1).

pub mod canonical;
pub mod error;
pub mod framing;

pub use canonical::canonical_bytes;
pub use error::WireError;
pub use framing::{read_envelope, write_envelope, DEFAULT_MAX_FRAME_SIZE};
