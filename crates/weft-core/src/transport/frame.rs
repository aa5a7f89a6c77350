//! Length-prefixed framing over async byte streams.
//!
//! A frame is a 4-byte little-endian body length followed by the body.
//! The length is checked against the configured cap before the body is
//! allocated.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Writes one frame.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    body: &[u8],
    max_frame_bytes: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: max_frame_bytes,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        len: body.len(),
        max: max_frame_bytes,
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}
