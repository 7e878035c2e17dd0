//! The transport seam between a core and its peers.
//!
//! The core never looks proxies up in a process-wide registry; it is
//! handed a [`ReplicaTransport`] at construction and calls it
//! synchronously. `riffle-net` provides the TCP implementation; tests may
//! substitute their own.

use std::path::{Path, PathBuf};

use crate::meta::CoreMeta;

/// Errors from RPCs and file streams.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection or stream I/O failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer executed the call and reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// The call did not complete within its deadline; the peer was sent a
    /// cancel message.
    #[error("call timed out")]
    Timeout,

    /// The call was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// No transport is configured on this core.
    #[error("no transport configured")]
    Unavailable,
}

/// Synchronous replication transport used by a core to reach a follower.
pub trait ReplicaTransport: Send + Sync {
    /// Asks the follower to prepare an empty staging directory and return
    /// its absolute path. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on connection, protocol or remote
    /// failure.
    fn transfer_backup(&self, target: &CoreMeta) -> Result<PathBuf, TransportError>;

    /// Tells the follower to swap the staged snapshot in. Idempotent in
    /// the sense that a repeat call with nothing staged fails cleanly
    /// without disturbing the applied state.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on connection, protocol or remote
    /// failure.
    fn apply_backup(&self, target: &CoreMeta) -> Result<(), TransportError>;

    /// Streams every regular file under `local_dir` (recursively) to
    /// `remote_dir` on the follower, preserving relative paths.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on any stream failure; the follower's
    /// partial state is discarded by its next staging request.
    fn send_directory(
        &self,
        target: &CoreMeta,
        local_dir: &Path,
        remote_dir: &Path,
    ) -> Result<(), TransportError>;
}

/// Transport for cores that never replicate (standalone or under test).
/// Every call fails with [`TransportError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl ReplicaTransport for NoTransport {
    fn transfer_backup(&self, _target: &CoreMeta) -> Result<PathBuf, TransportError> {
        Err(TransportError::Unavailable)
    }

    fn apply_backup(&self, _target: &CoreMeta) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }

    fn send_directory(
        &self,
        _target: &CoreMeta,
        _local_dir: &Path,
        _remote_dir: &Path,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unavailable)
    }
}
