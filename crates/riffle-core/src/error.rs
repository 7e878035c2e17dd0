//! Error types for the storage core facade.

use crate::transport::TransportError;
use riffle_storage::{SnapshotError, StorageError};

/// Errors from storage core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The durable engine failed; the core is poisoned until restart.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot creation, pruning or staging failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A transfer RPC or file stream failed; the whole transfer may be
    /// retried.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransportError),

    /// Operation on a destroyed core.
    #[error("core is destroyed")]
    Destroyed,

    /// Write attempted on a core that is not primary.
    #[error("core is {0} and does not accept writes")]
    NotPrimary(&'static str),

    /// The staging slot holds no complete snapshot to apply.
    #[error("no staged snapshot to apply")]
    NothingStaged,
}
