//! TCP implementation of the core's replication transport.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use riffle_core::{CoreMeta, ReplicaTransport, TransportError};

use crate::message::{read_frame, write_frame, BackupRpc, Tag, FILE_CHUNK_SIZE};

/// Default per-call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Synchronous replication transport over framed TCP.
///
/// Owns its own small runtime, so calls block the invoking thread and the
/// core stays free of async plumbing. Do not call from inside an async
/// task: like any blocking call it belongs on a plain or blocking-pool
/// thread.
pub struct TcpTransport {
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl TcpTransport {
    /// Creates a transport with the default per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the runtime cannot start.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_RPC_TIMEOUT)
    }

    /// Creates a transport with a specific per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the runtime cannot start.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("riffle-transport")
            .enable_all()
            .build()?;
        Ok(Self { runtime, timeout })
    }

    /// One request/response RPC on a fresh connection. On deadline expiry
    /// the peer is sent a best-effort `Cancel` frame and the caller gets
    /// [`TransportError::Timeout`].
    fn rpc(&self, target: &CoreMeta, tag: Tag) -> Result<Vec<u8>, TransportError> {
        let request = bincode::serialize(&BackupRpc {
            mpu_id: target.mpu_id.0,
            core_id: target.core_id.0,
        })
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let addr = (target.location.host.clone(), target.location.port);
        let timeout = self.timeout;

        self.runtime.block_on(async move {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, tag, &request).await?;

            match tokio::time::timeout(timeout, read_frame(&mut stream)).await {
                Err(_) => {
                    let _ = write_frame(&mut stream, Tag::Cancel, b"").await;
                    Err(TransportError::Timeout)
                }
                Ok(Err(e)) => Err(e.into()),
                Ok(Ok((Tag::Ok, payload))) => Ok(payload),
                Ok(Ok((Tag::Error, message))) => Err(TransportError::Remote(
                    String::from_utf8_lossy(&message).into_owned(),
                )),
                Ok(Ok((other, _))) => Err(TransportError::Protocol(format!(
                    "unexpected reply frame {other:?}"
                ))),
            }
        })
    }

    /// Streams one file to `remote_path` on the target, closing with an
    /// empty end-of-stream chunk and waiting for the receiver's ack.
    async fn stream_file(
        stream: &mut TcpStream,
        local_path: &Path,
        remote_path: &Path,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let dest = remote_path.to_string_lossy();
        write_frame(stream, Tag::FileTransfer, dest.as_bytes()).await?;

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            write_frame(stream, Tag::FileChunk, &buffer[..n]).await?;
        }
        write_frame(stream, Tag::FileChunk, b"").await?;

        match tokio::time::timeout(timeout, read_frame(stream)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((Tag::Ok, _))) => Ok(()),
            Ok(Ok((Tag::Error, message))) => Err(TransportError::Remote(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            Ok(Ok((other, _))) => Err(TransportError::Protocol(format!(
                "unexpected ack frame {other:?}"
            ))),
        }
    }
}

impl ReplicaTransport for TcpTransport {
    fn transfer_backup(&self, target: &CoreMeta) -> Result<PathBuf, TransportError> {
        let payload = self.rpc(target, Tag::TransferBackup)?;
        let path = PathBuf::from(String::from_utf8_lossy(&payload).into_owned());
        debug!(target = %target, path = %path.display(), "follower staged receive path");
        Ok(path)
    }

    fn apply_backup(&self, target: &CoreMeta) -> Result<(), TransportError> {
        self.rpc(target, Tag::ApplyBackup)?;
        Ok(())
    }

    fn send_directory(
        &self,
        target: &CoreMeta,
        local_dir: &Path,
        remote_dir: &Path,
    ) -> Result<(), TransportError> {
        let files = collect_files(local_dir)?;
        let addr = (target.location.host.clone(), target.location.port);
        let timeout = self.timeout;
        let count = files.len();

        self.runtime.block_on(async move {
            for (absolute, relative) in files {
                let mut stream = TcpStream::connect(addr.clone()).await?;
                let remote_path = remote_dir.join(&relative);
                Self::stream_file(&mut stream, &absolute, &remote_path, timeout).await?;
            }
            Ok::<(), TransportError>(())
        })?;
        info!(target = %target, files = count, from = %local_dir.display(), "directory streamed");
        Ok(())
    }
}

/// Every regular file under `dir`, as `(absolute, relative)` pairs.
fn collect_files(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, TransportError> {
    fn walk(
        base: &Path,
        dir: &Path,
        out: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<(), std::io::Error> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out)?;
            } else if path.is_file() {
                let relative = path.strip_prefix(base).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "path escaped base dir")
                })?;
                out.push((path.clone(), relative.to_path_buf()));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_files_recurses_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("wal")).unwrap();
        std::fs::write(dir.path().join("MANIFEST.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("data-000001.run"), b"run").unwrap();
        std::fs::write(dir.path().join("wal/wal.log"), b"").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let relatives: Vec<_> = files.iter().map(|(_, r)| r.clone()).collect();
        assert_eq!(
            relatives,
            vec![
                PathBuf::from("MANIFEST.json"),
                PathBuf::from("data-000001.run"),
                PathBuf::from("wal/wal.log"),
            ]
        );
    }
}
