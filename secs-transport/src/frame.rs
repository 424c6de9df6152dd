//! Length-prefixed HSMS frames
//!
//! Every HSMS message on the wire is a 4-byte big-endian length followed by
//! that many bytes (10-byte header plus optional SECS-II body). Once the
//! first byte of a frame has arrived the rest must follow without any gap
//! longer than T8.

use crate::error::{SecsError, SecsResult};
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Smallest valid frame: the message header
pub const MIN_FRAME_LENGTH: usize = 10;

/// Default upper bound for an accepted frame
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Read one frame (without its length prefix)
///
/// Waiting for the first byte is unbounded; every following read must
/// complete within `t8`.
///
/// # Returns
///
/// `Ok(None)` on a clean end of stream before a frame started
///
/// # Errors
///
/// * `SecsError::Timeout` if a read stalls longer than T8 mid-frame
/// * `SecsError::FrameInvalid` if the announced length is shorter than a
///   header or larger than `max_length`
/// * `SecsError::Connection` on I/O failure or EOF mid-frame
pub async fn read_frame<R>(
    reader: &mut R,
    t8: Duration,
    max_length: usize,
) -> SecsResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Ok(None);
    }
    read_exact_within(reader, &mut prefix[1..], t8).await?;

    let length = u32::from_be_bytes(prefix) as usize;
    if length < MIN_FRAME_LENGTH || length > max_length {
        return Err(SecsError::FrameInvalid(format!(
            "Frame length {} outside {}..={}",
            length, MIN_FRAME_LENGTH, max_length
        )));
    }

    let mut frame = vec![0u8; length];
    read_exact_within(reader, &mut frame, t8).await?;
    Ok(Some(frame))
}

/// Write one frame with its length prefix, bounded by `t8`
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], t8: Duration) -> SecsResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let length = u32::try_from(frame.len())
        .map_err(|_| SecsError::FrameInvalid(format!("Frame too long: {}", frame.len())))?;
    let mut buffer = BytesMut::with_capacity(frame.len() + 4);
    buffer.put_u32(length);
    buffer.put_slice(frame);

    let write = async {
        writer.write_all(&buffer).await?;
        writer.flush().await
    };
    tokio::time::timeout(t8, write)
        .await
        .map_err(|_| SecsError::Timeout(format!("T8 expired writing {} bytes", buffer.len())))??;
    Ok(())
}

async fn read_exact_within<R>(reader: &mut R, mut buf: &mut [u8], t8: Duration) -> SecsResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    while !buf.is_empty() {
        let n = tokio::time::timeout(t8, reader.read(buf))
            .await
            .map_err(|_| SecsError::Timeout("T8 inter-character timeout".to_string()))??;
        if n == 0 {
            return Err(SecsError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Connection closed mid-frame",
            )));
        }
        buf = &mut buf[n..];
    }
    Ok(())
}
