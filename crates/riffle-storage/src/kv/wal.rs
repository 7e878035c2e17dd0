//! Write-ahead log for the KV engine.
//!
//! Every mutation reaches the WAL before it reaches a memtable. A record is
//! a whole write batch (or a range delete), framed as
//! `u32 length | u32 crc32(payload) | payload` with the payload encoded via
//! bincode. Replay applies whole records only: a torn or corrupt tail frame
//! ends replay, which is what makes multi-op batches atomic across crashes.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::kv::batch::BatchOp;
use crate::kv::Namespace;

/// Frame header size: 4-byte length + 4-byte checksum.
const FRAME_HEADER: usize = 8;

/// One durable WAL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// An atomic write batch.
    Batch(Vec<BatchOp>),
    /// A range delete over `[lo, hi)` in one namespace.
    DeleteRange {
        /// Target namespace.
        ns: Namespace,
        /// Inclusive lower key bound.
        lo: Vec<u8>,
        /// Exclusive upper key bound.
        hi: Vec<u8>,
    },
}

/// Append-only WAL over a single file.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    sync_writes: bool,
}

impl Wal {
    /// Opens (or creates) the WAL file at `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            sync_writes,
        })
    }

    /// Appends one record, flushing it to the OS and optionally fsyncing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on encode or I/O failure.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), StorageError> {
        let payload = bincode::serialize(record).map_err(|e| StorageError::Codec(e.to_string()))?;
        let crc = crc32fast::hash(&payload);
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Codec("wal record exceeds u32 length".into()))?;

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        if self.sync_writes {
            self.sync()?;
        }
        Ok(())
    }

    /// Fsyncs the log file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on failure.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Discards every record, used once all memtables have been flushed to
    /// immutable runs.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on failure.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(0)?;
        file.sync_all()?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Replays every intact record from the start of the log.
    ///
    /// A truncated or checksum-failing tail frame ends replay silently (it
    /// is a torn write from a crash); corruption in the middle of the log is
    /// indistinguishable and handled the same way.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the file cannot be read at all.
    pub fn replay(path: &Path) -> Result<Vec<WalRecord>, StorageError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut header = [0u8; FRAME_HEADER];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(header[4..].try_into().unwrap());

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                tracing::warn!(path = %path.display(), "torn WAL tail frame, ending replay");
                break;
            }
            if crc32fast::hash(&payload) != crc {
                tracing::warn!(path = %path.display(), "WAL checksum mismatch, ending replay");
                break;
            }
            match bincode::deserialize(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "undecodable WAL record, ending replay");
                    break;
                }
            }
        }
        Ok(records)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[u8], value: &[u8]) -> BatchOp {
        BatchOp::Put {
            ns: Namespace::Data,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, false).unwrap();
        wal.append(&WalRecord::Batch(vec![put(b"k1", b"v1"), put(b"k2", b"v2")]))
            .unwrap();
        wal.append(&WalRecord::DeleteRange {
            ns: Namespace::Data,
            lo: vec![0],
            hi: vec![255],
        })
        .unwrap();
        wal.sync().unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            WalRecord::Batch(ops) => assert_eq!(ops.len(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = Wal::replay(&dir.path().join("absent.log")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, false).unwrap();
        wal.append(&WalRecord::Batch(vec![put(b"k1", b"v1")])).unwrap();
        wal.append(&WalRecord::Batch(vec![put(b"k2", b"v2")])).unwrap();
        wal.sync().unwrap();
        drop(wal);

        // Tear the last frame.
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_replay_stops_at_corrupt_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, false).unwrap();
        wal.append(&WalRecord::Batch(vec![put(b"k1", b"v1")])).unwrap();
        wal.sync().unwrap();
        drop(wal);

        // Flip a byte inside the payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let records = Wal::replay(&path).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_reset_discards_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, false).unwrap();
        wal.append(&WalRecord::Batch(vec![put(b"k1", b"v1")])).unwrap();
        wal.reset().unwrap();
        wal.append(&WalRecord::Batch(vec![put(b"k2", b"v2")])).unwrap();
        wal.sync().unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            WalRecord::Batch(ops) => match &ops[0] {
                BatchOp::Put { key, .. } => assert_eq!(key, b"k2"),
                other => panic!("expected put, got {other:?}"),
            },
            other => panic!("expected batch, got {other:?}"),
        }
    }
}
