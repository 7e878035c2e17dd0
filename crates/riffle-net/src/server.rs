//! Replication endpoint served by every core.
//!
//! One TCP connection carries one call: a backup RPC
//! (`transfer_backup` / `apply_backup`) or one file stream. RPC handlers
//! run on the blocking pool; a `Cancel` frame (or the peer vanishing)
//! abandons the wait for the in-flight call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use riffle_core::StorageCore;

use crate::message::{read_frame, write_frame, BackupRpc, Tag};

/// Serves backup RPCs and file streams for a set of registered cores.
pub struct CoreServer {
    cores: Arc<HashMap<(u64, u64), Arc<StorageCore>>>,
}

impl CoreServer {
    /// Builds a server dispatching to `cores` by `(mpu_id, core_id)`.
    #[must_use]
    pub fn new(cores: impl IntoIterator<Item = Arc<StorageCore>>) -> Self {
        let map = cores
            .into_iter()
            .map(|core| {
                let key = (core.meta().mpu_id.0, core.meta().core_id.0);
                (key, core)
            })
            .collect();
        Self {
            cores: Arc::new(map),
        }
    }

    /// Accept loop. Runs until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns the accept-loop I/O error.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "replication endpoint listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let cores = Arc::clone(&self.cores);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(cores, stream).await {
                    warn!(%peer, error = %e, "replication connection failed");
                }
            });
        }
    }
}

async fn handle_connection(
    cores: Arc<HashMap<(u64, u64), Arc<StorageCore>>>,
    mut stream: TcpStream,
) -> std::io::Result<()> {
    let (tag, payload) = read_frame(&mut stream).await?;
    match tag {
        Tag::TransferBackup | Tag::ApplyBackup => {
            handle_backup_rpc(cores, stream, tag, &payload).await
        }
        Tag::FileTransfer => handle_file_stream(stream, &payload).await,
        Tag::Cancel => Ok(()),
        other => {
            let message = format!("unexpected opening frame {other:?}");
            write_frame(&mut stream, Tag::Error, message.as_bytes()).await
        }
    }
}

async fn handle_backup_rpc(
    cores: Arc<HashMap<(u64, u64), Arc<StorageCore>>>,
    mut stream: TcpStream,
    tag: Tag,
    payload: &[u8],
) -> std::io::Result<()> {
    let rpc: BackupRpc = match bincode::deserialize(payload) {
        Ok(rpc) => rpc,
        Err(e) => {
            let message = format!("undecodable rpc: {e}");
            return write_frame(&mut stream, Tag::Error, message.as_bytes()).await;
        }
    };
    let Some(core) = cores.get(&(rpc.mpu_id, rpc.core_id)).cloned() else {
        let message = format!("no core {}/{} registered", rpc.mpu_id, rpc.core_id);
        return write_frame(&mut stream, Tag::Error, message.as_bytes()).await;
    };

    let mut call = tokio::task::spawn_blocking(move || match tag {
        Tag::TransferBackup => core
            .receive_backup()
            .map(|path| path.to_string_lossy().into_owned().into_bytes()),
        Tag::ApplyBackup => core.apply_backup().map(|()| Vec::new()),
        _ => unreachable!("dispatched only for backup tags"),
    });

    let (mut read_half, mut write_half) = stream.split();
    tokio::select! {
        joined = &mut call => {
            let reply = joined.map_err(|e| std::io::Error::other(e.to_string()))?;
            match reply {
                Ok(body) => write_frame(&mut write_half, Tag::Ok, &body).await?,
                Err(e) => write_frame(&mut write_half, Tag::Error, e.to_string().as_bytes()).await?,
            }
        }
        interrupt = read_frame(&mut read_half) => {
            match interrupt {
                Ok((Tag::Cancel, _)) => info!("backup rpc cancelled by peer"),
                Ok((other, _)) => warn!(?other, "unexpected frame during backup rpc"),
                Err(_) => info!("peer vanished during backup rpc"),
            }
            // The blocking call keeps running to completion; both RPCs are
            // idempotent so an abandoned result is harmless.
        }
    }
    Ok(())
}

/// Receives one file: the opening payload named the destination path, then
/// chunk frames follow until an empty chunk marks end-of-stream.
async fn handle_file_stream(mut stream: TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let path = PathBuf::from(String::from_utf8_lossy(payload).into_owned());
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut file = tokio::fs::File::create(&path).await?;

    loop {
        let (tag, chunk) = read_frame(&mut stream).await?;
        if tag != Tag::FileChunk {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected file chunk, got {tag:?}"),
            ));
        }
        if chunk.is_empty() {
            break;
        }
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;
    write_frame(&mut stream, Tag::Ok, b"").await?;
    Ok(())
}
