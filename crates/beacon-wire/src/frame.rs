//! Length-prefixed framing.
//!
//! Wire format: `[len: u32 BE][body: len bytes]`, where `body` is the output of
//! the session's [`FrameTransform`]. Frames never rely on a sentinel byte.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transform::{FrameTransform, TransformError};

/// Largest body (after the transform) accepted or produced by either peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

pub async fn write_frame<W>(
    writer: &mut W,
    body: Vec<u8>,
    transform: &dyn FrameTransform,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let sealed = transform.seal(body)?;
    if sealed.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: sealed.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = Vec::with_capacity(4 + sealed.len());
    buf.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
    buf.extend_from_slice(&sealed);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Oversize length headers are rejected before any body
/// bytes are read.
pub async fn read_frame<R>(
    reader: &mut R,
    transform: &dyn FrameTransform,
) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf).await {
        return Err(match err.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(err),
        });
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(transform.open(buf)?)
}
