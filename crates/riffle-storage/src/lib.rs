//! # Riffle Storage
//!
//! Durability layer for Riffle cores: the namespaced KV engine, the
//! instruction log, and consistent on-disk snapshots.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Clock and TTL value encodings.
pub mod codec;

/// Storage and snapshot error types.
pub mod error;

/// The instruction log - replayable mutations keyed by logical clock.
pub mod instruction;

/// The namespaced durable KV engine - WAL, memtables, immutable runs.
pub mod kv;

/// Snapshot strategies - hard-link checkpoints and full-copy backups.
pub mod snapshot;

pub use codec::CLOCK_K;
pub use error::{SnapshotError, StorageError};
pub use instruction::InstructionLog;
pub use kv::{
    BatchOp, EventSink, ImageMode, KvStore, Namespace, Scan, ScanRange, StoreEvent,
    StoreOptions, StoreTuning, WriteBatch,
};
pub use snapshot::{
    BackupSnapshots, CheckpointSnapshots, SnapshotStore, LOCAL_PREFIX, REMOTE_STAGING,
};
