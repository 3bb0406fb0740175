//! Length-prefixed framing: a 4-byte big-endian length followed by one JSON
//! object.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Cap for frames read before the peer has authenticated.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    /// Whether the stream can no longer be read from. Anything else is a bad
    /// message inside an intact stream and only that message is dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Io(_) | FrameError::TooLarge(_))
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(data.len()));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_frame_limited(reader, MAX_FRAME_SIZE).await
}

/// Like [`read_frame`], refusing any length prefix above `max_len` before
/// allocating.
pub async fn read_frame_limited<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}
