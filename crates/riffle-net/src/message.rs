//! Wire framing for the replication channel.
//!
//! Every frame is `u32 length | u8 tag | payload`. RPC payloads are
//! bincode; file chunks are raw bytes, and an empty chunk marks
//! end-of-stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload; a violation is a protocol error
/// rather than an allocation attack.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Bytes per file chunk frame.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Request: prepare the staging directory, reply with its path.
    TransferBackup = 1,
    /// Request: swap the staged snapshot in.
    ApplyBackup = 2,
    /// Opens a file stream; payload is the destination path.
    FileTransfer = 3,
    /// One chunk of file bytes; empty payload is end-of-stream.
    FileChunk = 4,
    /// Success reply; payload is call-specific.
    Ok = 5,
    /// Failure reply; payload is a UTF-8 message.
    Error = 6,
    /// Cancels the in-flight call on this channel.
    Cancel = 7,
}

impl TryFrom<u8> for Tag {
    type Error = std::io::Error;

    fn try_from(value: u8) -> Result<Self, std::io::Error> {
        match value {
            1 => Ok(Tag::TransferBackup),
            2 => Ok(Tag::ApplyBackup),
            3 => Ok(Tag::FileTransfer),
            4 => Ok(Tag::FileChunk),
            5 => Ok(Tag::Ok),
            6 => Ok(Tag::Error),
            7 => Ok(Tag::Cancel),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame tag {other}"),
            )),
        }
    }
}

/// Identifies the target core of a backup RPC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackupRpc {
    /// Replica group id.
    pub mpu_id: u64,
    /// Member id within the group.
    pub core_id: u64,
}

/// Writes one frame.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn write_frame<W>(writer: &mut W, tag: Tag, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&[tag as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// # Errors
///
/// Returns the underlying I/O error; an oversized or unknown frame maps to
/// `InvalidData`.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<(Tag, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut tag_byte = [0u8; 1];
    reader.read_exact(&mut tag_byte).await?;
    let tag = Tag::try_from(tag_byte[0])?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((tag, payload))
}
