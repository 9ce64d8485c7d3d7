use thiserror::Error;

/// Failures writing a framed envelope to a stream (spec §4.1).
///
/// Reads never surface this type: a malformed or oversized frame on read is
/// reported as `None` from [`crate::read_envelope`] and the connection is
/// dropped, never a panic or a propagated error.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error writing frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope exceeds max_frame_size ({len} > {max})")]
    TooLarge { len: usize, max: usize },
}
