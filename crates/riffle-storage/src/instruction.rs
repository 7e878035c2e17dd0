//! The instruction log: a durable ordered map from logical clock to the
//! raw bytes of a mutation, kept for replay during role transitions.
//!
//! Clocks are stored big-endian (see [`crate::codec`]) so numeric ranges
//! are contiguous key ranges, which makes the periodic prefix compaction a
//! single range delete. The reserved [`CLOCK_K`] entry holds the highest
//! clock the core has accepted (`tick`); it sorts after every clock key,
//! so clock-range deletes never touch it.

use std::path::{Path, PathBuf};

use crate::codec::{self, CLOCK_K};
use crate::error::StorageError;
use crate::kv::{KvStore, Namespace, StoreOptions, StoreTuning, WriteBatch};

/// Durable log of `(clock, payload)` instructions. Never subject to TTL
/// and never swapped during snapshot restore.
pub struct InstructionLog {
    store: KvStore,
}

impl InstructionLog {
    /// Opens the log rooted at `dir` (conventionally `<core>/instruction/`).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure or corruption.
    pub fn open(
        dir: impl Into<PathBuf>,
        tuning: StoreTuning,
        sync_writes: bool,
    ) -> Result<Self, StorageError> {
        let store = KvStore::open(
            dir,
            StoreOptions {
                namespaces: vec![Namespace::Data],
                ttl_seconds: 0,
                sync_writes,
                tuning,
            },
        )?;
        Ok(Self { store })
    }

    /// Persists the instruction bytes under `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn put(&self, clock: u64, payload: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(Namespace::Data, codec::encode_clock(clock).to_vec(), payload.to_vec());
        self.store.write_batch(batch)
    }

    /// Looks up the instruction stored at `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn get(&self, clock: u64) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.get(Namespace::Data, &codec::encode_clock(clock))
    }

    /// Removes the instruction at `clock`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn delete(&self, clock: u64) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete(Namespace::Data, codec::encode_clock(clock).to_vec());
        self.store.write_batch(batch)
    }

    /// Removes every instruction with clock in `[lo, hi)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn delete_range(&self, lo: u64, hi: u64) -> Result<(), StorageError> {
        self.store
            .delete_range(Namespace::Data, &codec::encode_clock(lo), &codec::encode_clock(hi))
    }

    /// Reads the accept-clock (`tick`). Missing key reads as 0.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn read_tick(&self) -> Result<u64, StorageError> {
        Ok(self
            .store
            .get(Namespace::Data, CLOCK_K)?
            .and_then(|v| codec::decode_clock(&v))
            .unwrap_or(0))
    }

    /// Persists the accept-clock (`tick`).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn write_tick(&self, clock: u64) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(Namespace::Data, CLOCK_K.to_vec(), codec::encode_clock(clock).to_vec());
        self.store.write_batch(batch)
    }

    /// Makes every prior put durable on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.flush_all()
    }

    /// Hints background compaction of the log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn compact(&self) -> Result<(), StorageError> {
        self.store.compact()
    }

    /// Closes the log; later operations fail fast.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the final WAL sync fails.
    pub fn close(&self) -> Result<(), StorageError> {
        self.store.close()
    }

    /// The log's root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.store.dir()
    }
}
