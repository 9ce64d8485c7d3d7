use mesh_core::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::WireError;

/// Default ceiling on a single frame body, before the 4-byte length prefix
/// (spec §4.1): 8 MiB. Large enough for an OTA chunk plus envelope overhead,
/// small enough that a corrupt or hostile length prefix cannot be used to
/// stall the reader on an unbounded allocation.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Write `env` to `stream` as `[4-byte BE u32 length][JSON body]`.
///
/// The length is validated against `max_frame_size` before anything is
/// written, so a caller never emits a frame its own peers would reject.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    stream: &mut W,
    env: &Envelope,
    max_frame_size: usize,
) -> Result<(), WireError> {
    let body = serde_json::to_vec(env).expect("Envelope always serializes");
    if body.len() > max_frame_size {
        return Err(WireError::TooLarge { len: body.len(), max: max_frame_size });
    }
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed envelope from `stream`.
///
/// Returns `None` — never an `Err`, never a panic — on a closed stream, an
/// `N` exceeding `max_frame_size`, or a body that fails to parse as a valid
/// `Envelope`. Per spec §4.1 a `None` return is an instruction to the caller
/// to drop the connection; the malformed-input details are logged at
/// `debug` and discarded rather than propagated, since a corrupt frame from
/// a peer is never actionable beyond disconnecting it.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_frame_size: usize,
) -> Option<Envelope> {
    let mut len_buf = [0u8; 4];
    if let Err(err) = stream.read_exact(&mut len_buf).await {
        debug!(error = %err, "read_envelope: failed to read length prefix");
        return None;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        debug!(len, max_frame_size, "read_envelope: frame exceeds max_frame_size");
        return None;
    }
    let mut body = vec![0u8; len];
    if let Err(err) = stream.read_exact(&mut body).await {
        debug!(error = %err, "read_envelope: failed to read frame body");
        return None;
    }
    match serde_json::from_slice::<Envelope>(&body) {
        Ok(env) => Some(env),
        Err(err) => {
            debug!(error = %err, "read_envelope: failed to parse envelope JSON");
            None
        }
    }
}
