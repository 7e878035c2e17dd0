//! Error types for the storage layer.

use std::path::PathBuf;

/// Errors from the KV engine and the instruction log.
///
/// Every variant is fatal to the owning core: the engine never retries or
/// downgrades an I/O failure into a partial success.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error from the filesystem.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encode/decode failure.
    #[error("storage codec error: {0}")]
    Codec(String),

    /// Manifest serialization/deserialization error.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// On-disk data failed validation.
    #[error("corrupted storage file {path}: {detail}")]
    Corrupted {
        /// File that failed validation.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },

    /// Operation on a closed store handle.
    #[error("store is closed")]
    Closed,
}

/// Errors from checkpoint/backup creation, listing, pruning and staging.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// I/O error while manipulating snapshot directories.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying engine failed while producing the snapshot image.
    #[error("snapshot storage error: {0}")]
    Storage(#[from] StorageError),

    /// No snapshot matching the requested prefix exists.
    #[error("no snapshot with prefix '{0}'")]
    NotFound(String),

    /// The staging slot does not hold a complete snapshot image.
    #[error("staged snapshot at {0} is missing or incomplete")]
    StagingInvalid(PathBuf),
}
