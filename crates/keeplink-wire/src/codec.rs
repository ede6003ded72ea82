//! Length-prefixed frame codec.
//!
//! Every frame on the wire is a 4-byte big-endian length header followed by
//! that many payload bytes. A zero length is a keepalive and carries no
//! payload.
//!
//! ```text
//! +----------------+----------------------+
//! | length: u32 BE | payload: [u8; length] |
//! +----------------+----------------------+
//! ```

use crate::error::WireError;
use bytes::{Bytes, BytesMut};
use keeplink_types::config::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_READ_CHUNK_SIZE};
use keeplink_types::ProtocolConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame length header.
pub const HEADER_LEN: usize = 4;

/// Encode a frame length header.
pub fn encode_length(len: u32) -> [u8; HEADER_LEN] {
    len.to_be_bytes()
}

/// Decode a frame length header.
pub fn decode_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Stateless frame reader/writer parameterised by size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: u32,
    read_chunk_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a codec. A chunk size of zero is treated as one byte.
    pub fn new(max_frame_size: u32, read_chunk_size: usize) -> Self {
        Self {
            max_frame_size,
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    /// Create a codec with the ceiling and chunk size from `config`.
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.max_frame_size, config.read_chunk_size)
    }

    /// Read exactly `len` bytes, at most one chunk per read call.
    ///
    /// End of stream before the buffer is full is reported as
    /// [`WireError::ConnectionClosed`]; anything read so far is discarded.
    pub async fn read_exact<R>(&self, reader: &mut R, len: usize) -> Result<BytesMut, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            let size = (len - filled).min(self.read_chunk_size);
            let n = reader.read(&mut buf[filled..filled + size]).await?;
            if n == 0 {
                return Err(WireError::ConnectionClosed);
            }
            filled += n;
        }
        Ok(buf)
    }

    /// Read one full frame.
    ///
    /// Returns an empty buffer for a keepalive. A declared length at or above
    /// the ceiling fails with [`WireError::FrameTooLarge`] before any payload
    /// is read.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Bytes, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::ConnectionClosed);
            }
            Err(e) => return Err(WireError::Io(e)),
        }

        let len = decode_length(&header);
        if len == 0 {
            return Ok(Bytes::new());
        }
        if len >= self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        Ok(self.read_exact(reader, len as usize).await?.freeze())
    }

    /// Check that `payload` fits in a frame the peer will accept.
    pub fn check_len(&self, payload: &[u8]) -> Result<u32, WireError> {
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if len >= self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(len)
    }

    /// Write a complete frame (header then payload) and flush.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = self.check_len(payload)?;
        writer.write_all(&encode_length(len)).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Write a zero-length keepalive frame and flush.
pub async fn write_keepalive<W>(writer: &mut W) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_length(0)).await?;
    writer.flush().await?;
    Ok(())
}
