//! Data-channel framing: an 8-byte big-endian length followed by the body.
//!
//! ```text
//! +----------------------+---------------------------+
//! | length (u64, BE)     | body (length bytes)       |
//! +----------------------+---------------------------+
//! ```
//!
//! No checksum and no acknowledgement beyond TCP delivery.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ArbiterError, Result};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Read buffer growth step when reconstructing a payload.
const READ_CHUNK: usize = 64 * 1024;

/// Write one length-prefixed payload.
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let prefix = (payload.len() as u64).to_be_bytes();
    writer
        .write_all(&prefix)
        .await
        .map_err(|e| ArbiterError::io("writing payload length", e))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| ArbiterError::io("writing payload body", e))?;
    writer
        .flush()
        .await
        .map_err(|e| ArbiterError::io("flushing payload", e))
}

/// Read the length prefix. `Ok(None)` if the peer closed before all eight
/// bytes arrived.
pub async fn read_length<R>(reader: &mut R) -> Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => Ok(Some(u64::from_be_bytes(prefix))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(ArbiterError::io("reading payload length", e)),
    }
}

/// Read one payload and return its body.
///
/// `Ok(None)` is a clean disconnect. A body cut short by the peer is
/// [`ArbiterError::ShortRead`].
pub async fn read_payload<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let Some(length) = read_length(reader).await? else {
        return Ok(None);
    };

    // The prefix is untrusted, so grow the buffer as bytes actually arrive.
    let capacity = usize::try_from(length).unwrap_or(usize::MAX).min(READ_CHUNK);
    let mut body = Vec::with_capacity(capacity);
    let received = reader
        .take(length)
        .read_to_end(&mut body)
        .await
        .map_err(|e| ArbiterError::io("reading payload body", e))? as u64;

    if received < length {
        return Err(ArbiterError::short_read(length, received));
    }
    Ok(Some(Bytes::from(body)))
}

/// Read one payload and throw the body away. Returns the body length.
pub async fn drain_payload<R>(reader: &mut R) -> Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let Some(length) = read_length(reader).await? else {
        return Ok(None);
    };

    let received = tokio::io::copy(&mut reader.take(length), &mut tokio::io::sink())
        .await
        .map_err(|e| ArbiterError::io("draining payload body", e))?;

    if received < length {
        return Err(ArbiterError::short_read(length, received));
    }
    Ok(Some(length))
}
