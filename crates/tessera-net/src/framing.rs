//! Length-prefixed frames on a byte stream.
//!
//! ```text
//! +-------------------+----------------------+
//! | length (2 bytes)  |   payload            |
//! | u16 little-endian |   (length <= 1280)   |
//! +-------------------+----------------------+
//! ```
//!
//! A frame is only handed to the caller once its header and whole payload
//! have arrived. A zero-length frame is legal on the wire.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::message::{HEADER_SIZE, MAX_PAYLOAD, MessagePool, NetworkMessage, PooledMessage};

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length header announces more than [`MAX_PAYLOAD`] bytes.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Announced payload size.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// The peer closed the stream before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame into a buffer taken from `pool`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    pool: &MessagePool,
) -> Result<PooledMessage, FrameError> {
    let mut len_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let payload_len = u16::from_le_bytes(len_buf) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD,
        });
    }

    let mut message = pool.get();
    if payload_len > 0 {
        reader
            .read_exact(message.fill_payload(payload_len))
            .await
            .map_err(map_eof)?;
    }

    Ok(message)
}

/// Write one frame (header + payload) and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &mut NetworkMessage,
) -> Result<(), FrameError> {
    writer.write_all(message.frame_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
