//! Immutable sorted run files.
//!
//! A run is a flushed memtable: a sorted sequence of `(key, slot)` pairs
//! where a slot is either a value or a tombstone. Runs are written once,
//! fsynced, and never modified, which is what lets checkpoints hard-link
//! them instead of copying.
//!
//! File format: `RRUN` magic | u32 crc32(payload) | bincode payload.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

const MAGIC: &[u8; 4] = b"RRUN";

/// A stored slot: a live value or a tombstone.
pub type Slot = Option<Vec<u8>>;

#[derive(Serialize, Deserialize)]
struct RunPayload {
    entries: Vec<(Vec<u8>, Slot)>,
}

/// An immutable sorted run, resident in memory with its backing file on
/// disk.
#[derive(Debug)]
pub struct Run {
    /// File name within the store directory.
    pub name: String,
    /// Sorted entries; `None` marks a tombstone.
    pub entries: BTreeMap<Vec<u8>, Slot>,
    /// Size of the backing file in bytes.
    pub file_bytes: u64,
}

impl Run {
    /// Writes `entries` as a new run file, fsyncing file and directory.
    ///
    /// The file is written under a `.tmp` name and renamed into place so a
    /// crash never leaves a half-written run visible.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on encode or I/O failure.
    pub fn write(dir: &Path, name: &str, entries: BTreeMap<Vec<u8>, Slot>) -> Result<Self, StorageError> {
        let payload = bincode::serialize(&RunPayload {
            entries: entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
        .map_err(|e| StorageError::Codec(e.to_string()))?;
        let crc = crc32fast::hash(&payload);

        let path = dir.join(name);
        let tmp = dir.join(format!("{name}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(MAGIC)?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        sync_dir(dir)?;

        let file_bytes = std::fs::metadata(&path)?.len();
        Ok(Self {
            name: name.to_string(),
            entries,
            file_bytes,
        })
    }

    /// Loads and validates a run file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] when the magic or checksum does
    /// not match, [`StorageError::Io`] on read failure.
    pub fn load(dir: &Path, name: &str) -> Result<Self, StorageError> {
        let path = dir.join(name);
        let mut file = File::open(&path)?;
        let file_bytes = file.metadata()?.len();

        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|_| corrupted(&path, "short header"))?;
        if &header[..4] != MAGIC {
            return Err(corrupted(&path, "bad magic"));
        }
        let crc = u32::from_le_bytes(header[4..].try_into().unwrap());

        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(corrupted(&path, "checksum mismatch"));
        }

        let decoded: RunPayload =
            bincode::deserialize(&payload).map_err(|e| corrupted(&path, &e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            entries: decoded.entries.into_iter().collect(),
            file_bytes,
        })
    }

    /// Number of entries, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn corrupted(path: &Path, detail: &str) -> StorageError {
    StorageError::Corrupted {
        path: PathBuf::from(path),
        detail: detail.to_string(),
    }
}

/// Fsyncs a directory so renames within it are durable.
pub fn sync_dir(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
