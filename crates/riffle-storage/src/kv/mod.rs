//! Namespaced durable KV engine.
//!
//! The engine backs both the core's data store (`data` + `meta` namespaces)
//! and the instruction log (single namespace). Layout per store directory:
//!
//! ```text
//! {dir}/MANIFEST.json     run listing + next sequence number
//! {dir}/wal/wal.log       write-ahead log, whole-batch records
//! {dir}/{ns}-{seq}.run    immutable sorted runs, newest seq wins
//! ```
//!
//! Writes reach the WAL first, then per-namespace memtables; memtables are
//! flushed to immutable runs which checkpoints can hard-link. Reads merge
//! the memtable over the runs, newest first. Scans take an owned
//! point-in-time view at creation, so iterators stay valid across later
//! writes, flushes and compactions.

mod batch;
mod run;
mod wal;

pub use batch::{BatchOp, WriteBatch};
pub use run::Slot;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec;
use crate::error::StorageError;
use run::Run;
use wal::{Wal, WalRecord};

/// Logical namespaces inside one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// User records.
    Data,
    /// Reserved records, most importantly the applied-clock key. Never
    /// subject to TTL reclamation.
    Meta,
}

impl Namespace {
    /// Stable name used in file names and the manifest.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Data => "data",
            Namespace::Meta => "meta",
        }
    }
}

/// Events emitted by the engine after background-relevant work.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A memtable was flushed to an immutable run.
    FlushCompleted(Namespace),
    /// A namespace's runs were merged.
    CompactionCompleted(Namespace),
    /// Background maintenance failed.
    BackgroundError(String),
}

/// Callback receiving [`StoreEvent`]s. Invoked outside the store lock.
pub type EventSink = Box<dyn Fn(StoreEvent) + Send + Sync>;

/// Engine tuning knobs, loadable from an optional JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreTuning {
    /// Memtable size that triggers an automatic flush of a namespace.
    pub write_buffer_bytes: usize,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 8 * 1024 * 1024,
        }
    }
}

impl StoreTuning {
    /// Loads tuning from a JSON file, falling back to defaults when the
    /// file is absent or invalid (a warning is logged, matching the
    /// lenient options-file handling of the storage engines this models).
    #[must_use]
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(tuning) => tuning,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid tuning file, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "tuning file not readable, using defaults");
                Self::default()
            }
        }
    }
}

/// Store construction options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Namespaces this store serves.
    pub namespaces: Vec<Namespace>,
    /// TTL for the data namespace in seconds; 0 disables TTL mode.
    pub ttl_seconds: u64,
    /// Fsync the WAL on every batch.
    pub sync_writes: bool,
    /// Engine tuning.
    pub tuning: StoreTuning,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            namespaces: vec![Namespace::Data, Namespace::Meta],
            ttl_seconds: 0,
            sync_writes: false,
            tuning: StoreTuning::default(),
        }
    }
}

impl StoreOptions {
    fn ttl_enabled(&self) -> bool {
        self.ttl_seconds > 0
    }
}

/// How a snapshot image materializes run files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// Hard-link immutable runs (cheap, same filesystem).
    HardLink,
    /// Copy file contents (backup mode).
    Copy,
}

/// Key range for a scan. Bounds default to unbounded.
#[derive(Debug, Clone, Default)]
pub struct ScanRange {
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    include_lo: bool,
    include_hi: bool,
}

impl ScanRange {
    /// The full namespace.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A bounded range; `None` means unbounded on that side.
    #[must_use]
    pub fn between(
        lo: Option<Vec<u8>>,
        hi: Option<Vec<u8>>,
        include_lo: bool,
        include_hi: bool,
    ) -> Self {
        Self {
            lo,
            hi,
            include_lo,
            include_hi,
        }
    }

    /// Whether no key can possibly satisfy the bounds. Guarded before
    /// handing the bounds to `BTreeMap::range`, which panics on inverted
    /// ranges.
    fn is_vacuous(&self) -> bool {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) => {
                lo > hi || (lo == hi && !(self.include_lo && self.include_hi))
            }
            _ => false,
        }
    }

    fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let lo = match (&self.lo, self.include_lo) {
            (None, _) => Bound::Unbounded,
            (Some(k), true) => Bound::Included(k.as_slice()),
            (Some(k), false) => Bound::Excluded(k.as_slice()),
        };
        let hi = match (&self.hi, self.include_hi) {
            (None, _) => Bound::Unbounded,
            (Some(k), true) => Bound::Included(k.as_slice()),
            (Some(k), false) => Bound::Excluded(k.as_slice()),
        };
        (lo, hi)
    }
}

/// Owned point-in-time scan result, ordered by key.
pub struct Scan {
    items: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for Scan {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunMeta {
    file: String,
    entries: u64,
    bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    next_seq: u64,
    runs: BTreeMap<String, Vec<RunMeta>>,
}

const MANIFEST_FILE: &str = "MANIFEST.json";
const WAL_DIR: &str = "wal";
const WAL_FILE: &str = "wal.log";

struct SpaceState {
    memtable: BTreeMap<Vec<u8>, Slot>,
    mem_bytes: usize,
    runs: Vec<Arc<Run>>,
}

impl SpaceState {
    fn new() -> Self {
        Self {
            memtable: BTreeMap::new(),
            mem_bytes: 0,
            runs: Vec::new(),
        }
    }
}

struct Inner {
    wal: Wal,
    spaces: BTreeMap<Namespace, SpaceState>,
    next_seq: u64,
    closed: bool,
}

/// The namespaced durable KV store.
///
/// Thread-safe: concurrent readers are served under a shared lock while
/// writers serialize on the exclusive lock, so the sequence of durable
/// states any reader observes is well ordered.
pub struct KvStore {
    dir: PathBuf,
    opts: StoreOptions,
    inner: RwLock<Inner>,
    events: Mutex<Option<EventSink>>,
}

impl KvStore {
    /// Opens a store, creating the directory tree on first use and
    /// replaying the WAL into memtables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure or on-disk corruption.
    pub fn open(dir: impl Into<PathBuf>, opts: StoreOptions) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join(WAL_DIR))?;

        let manifest = Self::load_manifest(&dir)?;
        let mut spaces = BTreeMap::new();
        for &ns in &opts.namespaces {
            let mut state = SpaceState::new();
            if let Some(metas) = manifest.runs.get(ns.as_str()) {
                for meta in metas {
                    state.runs.push(Arc::new(Run::load(&dir, &meta.file)?));
                }
            }
            spaces.insert(ns, state);
        }

        let wal_path = dir.join(WAL_DIR).join(WAL_FILE);
        let records = Wal::replay(&wal_path)?;
        let replayed = records.len();
        let mut inner = Inner {
            wal: Wal::open(&wal_path, opts.sync_writes)?,
            spaces,
            next_seq: manifest.next_seq,
            closed: false,
        };
        let mut pending_ranges = Vec::new();
        for record in records {
            Self::apply_record(&mut inner, &record);
            if let WalRecord::DeleteRange { ns, lo, hi } = record {
                pending_ranges.push((ns, lo, hi));
            }
        }

        info!(
            dir = %dir.display(),
            namespaces = opts.namespaces.len(),
            wal_records = replayed,
            ttl_seconds = opts.ttl_seconds,
            "opened kv store"
        );
        let store = Self {
            dir,
            opts,
            inner: RwLock::new(inner),
            events: Mutex::new(None),
        };
        // A crash may have landed between a range delete's WAL record and
        // the rewrite of the overlapping runs; redo the rewrite (no-op for
        // runs that were already filtered).
        for (ns, lo, hi) in pending_ranges {
            let mut inner = store.inner.write();
            store.rewrite_runs_excluding(&mut inner, ns, &lo, &hi)?;
        }
        Ok(store)
    }

    /// Installs the event sink, replacing any previous one.
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.events.lock() = Some(sink);
    }

    /// The store's root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads one key. TTL suffixes are stripped; expired data-namespace
    /// entries read as absent even before compaction reclaims them.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let space = Self::space(&inner, ns)?;
        let slot = space.memtable.get(key).cloned().or_else(|| {
            space
                .runs
                .iter()
                .rev()
                .find_map(|run| run.entries.get(key).cloned())
        });
        Ok(slot.and_then(|s| self.resolve(ns, s, codec::now_nanos())))
    }

    /// Point-in-time ordered scan over a key range.
    ///
    /// The view is established at creation: later writes, flushes and
    /// compactions do not affect an iterator already handed out.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn scan(&self, ns: Namespace, range: &ScanRange) -> Result<Scan, StorageError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let space = Self::space(&inner, ns)?;
        if range.is_vacuous() {
            return Ok(Scan {
                items: Vec::new().into_iter(),
            });
        }
        let bounds = range.bounds();

        let mut merged: BTreeMap<Vec<u8>, Slot> = BTreeMap::new();
        for run in &space.runs {
            for (k, slot) in run.entries.range::<[u8], _>(bounds) {
                merged.insert(k.clone(), slot.clone());
            }
        }
        for (k, slot) in space.memtable.range::<[u8], _>(bounds) {
            merged.insert(k.clone(), slot.clone());
        }
        drop(inner);

        let now = codec::now_nanos();
        let items: Vec<(Vec<u8>, Vec<u8>)> = merged
            .into_iter()
            .filter_map(|(k, slot)| self.resolve(ns, slot, now).map(|v| (k, v)))
            .collect();
        Ok(Scan {
            items: items.into_iter(),
        })
    }

    /// Commits a batch atomically: one WAL record, then the memtables.
    ///
    /// In TTL mode every put value is suffixed with the current timestamp
    /// before it reaches the WAL, so replay preserves original write times.
    ///
    /// # Errors
    ///
    /// Any failure leaves the batch entirely unapplied (the WAL record is
    /// the commit point). Errors are fatal to the owning core.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(StorageError::Closed);
            }

            let mut ops = batch.ops;
            if self.opts.ttl_enabled() {
                let now = codec::now_nanos();
                for op in &mut ops {
                    if let BatchOp::Put { value, .. } = op {
                        *value = codec::wrap_ttl(value, now);
                    }
                }
            }

            let record = WalRecord::Batch(ops);
            inner.wal.append(&record)?;
            Self::apply_record(&mut inner, &record);

            let over: Vec<Namespace> = inner
                .spaces
                .iter()
                .filter(|(_, s)| s.mem_bytes > self.opts.tuning.write_buffer_bytes)
                .map(|(&ns, _)| ns)
                .collect();
            for ns in over {
                if let Some(event) = self.flush_space(&mut inner, ns)? {
                    events.push(event);
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    /// Flushes one namespace's memtable to an immutable run.
    ///
    /// No-op (and no event) when the memtable is empty. The WAL is reset
    /// once every namespace's memtable is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn flush(&self, ns: Namespace) -> Result<(), StorageError> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(StorageError::Closed);
            }
            if let Some(event) = self.flush_space(&mut inner, ns)? {
                events.push(event);
            }
        }
        self.emit(events);
        Ok(())
    }

    /// Flushes every namespace.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn flush_all(&self) -> Result<(), StorageError> {
        let events = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(StorageError::Closed);
            }
            self.flush_all_locked(&mut inner)?
        };
        self.emit(events);
        Ok(())
    }

    /// Merges each namespace's runs into one, dropping tombstones and, in
    /// TTL mode, expired data-namespace entries. Memtables are flushed
    /// first so reclamation covers unflushed writes too.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(StorageError::Closed);
            }
            let namespaces: Vec<Namespace> = inner.spaces.keys().copied().collect();
            let now = codec::now_nanos();
            for ns in namespaces {
                self.flush_space(&mut inner, ns)?;
                if self.compact_space(&mut inner, ns, now, &mut events)? {
                    events.push(StoreEvent::CompactionCompleted(ns));
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    /// Removes every key in `[lo, hi)` from a namespace, rewriting any
    /// overlapping immutable runs with the range filtered out.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn delete_range(&self, ns: Namespace, lo: &[u8], hi: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let record = WalRecord::DeleteRange {
            ns,
            lo: lo.to_vec(),
            hi: hi.to_vec(),
        };
        inner.wal.append(&record)?;
        Self::apply_record(&mut inner, &record);
        self.rewrite_runs_excluding(&mut inner, ns, lo, hi)?;
        Ok(())
    }

    /// Approximate live-entry count; may over-report keys shadowed across
    /// runs and tombstoned keys.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn approximate_count(&self, ns: Namespace) -> Result<u64, StorageError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let space = Self::space(&inner, ns)?;
        let runs: u64 = space.runs.iter().map(|r| r.len() as u64).sum();
        Ok(space.memtable.len() as u64 + runs)
    }

    /// Approximate byte size of the namespace's occupied key range:
    /// memtable bytes plus run file sizes, 0 when no live entry exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Closed`] after [`KvStore::close`].
    pub fn approximate_size(&self, ns: Namespace) -> Result<u64, StorageError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let space = Self::space(&inner, ns)?;
        let any_live = space.memtable.values().any(Option::is_some)
            || space
                .runs
                .iter()
                .any(|r| r.entries.values().any(Option::is_some));
        if !any_live {
            return Ok(0);
        }
        let file_bytes: u64 = space.runs.iter().map(|r| r.file_bytes).sum();
        Ok(space.mem_bytes as u64 + file_bytes)
    }

    /// Produces a self-consistent image of the store in `target`: flushes
    /// all memtables, then hard-links (or copies) the immutable runs and
    /// writes the manifest. The resulting directory opens as a store whose
    /// contents equal this store's at the moment of the call.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    pub fn image_into(&self, target: &Path, mode: ImageMode) -> Result<(), StorageError> {
        let events = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(StorageError::Closed);
            }
            let events = self.flush_all_locked(&mut inner)?;

            std::fs::create_dir_all(target)?;
            std::fs::create_dir_all(target.join(WAL_DIR))?;
            for space in inner.spaces.values() {
                for run in &space.runs {
                    let src = self.dir.join(&run.name);
                    let dst = target.join(&run.name);
                    match mode {
                        ImageMode::HardLink => std::fs::hard_link(&src, &dst)?,
                        ImageMode::Copy => {
                            std::fs::copy(&src, &dst)?;
                        }
                    }
                }
            }
            Self::write_manifest_to(target, &inner)?;
            run::sync_dir(target)?;
            events
        };
        self.emit(events);
        Ok(())
    }

    /// Whether `path` looks like a complete store image (has a manifest).
    /// Used to validate a staged snapshot before swapping it in.
    #[must_use]
    pub fn is_store_dir(path: &Path) -> bool {
        path.join(MANIFEST_FILE).is_file()
    }

    /// Marks the store closed and syncs the WAL. Later operations fail
    /// with [`StorageError::Closed`]. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the final WAL sync fails.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.wal.sync()?;
        inner.closed = true;
        info!(dir = %self.dir.display(), "closed kv store");
        Ok(())
    }

    // ── internals ──

    fn space<'a>(inner: &'a Inner, ns: Namespace) -> Result<&'a SpaceState, StorageError> {
        inner.spaces.get(&ns).ok_or(StorageError::Closed)
    }

    fn resolve(&self, ns: Namespace, slot: Slot, now: u64) -> Option<Vec<u8>> {
        let stored = slot?;
        if !self.opts.ttl_enabled() {
            return Some(stored);
        }
        if ns == Namespace::Data && codec::ttl_expired(&stored, self.opts.ttl_seconds, now) {
            return None;
        }
        Some(codec::unwrap_ttl(&stored).to_vec())
    }

    fn apply_record(inner: &mut Inner, record: &WalRecord) {
        match record {
            WalRecord::Batch(ops) => {
                for op in ops {
                    match op {
                        BatchOp::Put { ns, key, value } => {
                            if let Some(space) = inner.spaces.get_mut(ns) {
                                space.mem_bytes += key.len() + value.len();
                                space.memtable.insert(key.clone(), Some(value.clone()));
                            }
                        }
                        BatchOp::Delete { ns, key } => {
                            if let Some(space) = inner.spaces.get_mut(ns) {
                                space.mem_bytes += key.len();
                                space.memtable.insert(key.clone(), None);
                            }
                        }
                    }
                }
            }
            WalRecord::DeleteRange { ns, lo, hi } => {
                if let Some(space) = inner.spaces.get_mut(ns) {
                    let doomed: Vec<Vec<u8>> = space
                        .memtable
                        .range::<[u8], _>((
                            Bound::Included(lo.as_slice()),
                            Bound::Excluded(hi.as_slice()),
                        ))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        space.memtable.remove(&key);
                    }
                }
            }
        }
    }

    fn flush_all_locked(&self, inner: &mut Inner) -> Result<Vec<StoreEvent>, StorageError> {
        let namespaces: Vec<Namespace> = inner.spaces.keys().copied().collect();
        let mut events = Vec::new();
        for ns in namespaces {
            if let Some(event) = self.flush_space(inner, ns)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn flush_space(
        &self,
        inner: &mut Inner,
        ns: Namespace,
    ) -> Result<Option<StoreEvent>, StorageError> {
        let seq = inner.next_seq;
        {
            let Some(space) = inner.spaces.get_mut(&ns) else {
                return Ok(None);
            };
            if space.memtable.is_empty() {
                return Ok(None);
            }
            let memtable = std::mem::take(&mut space.memtable);
            let name = format!("{}-{seq:06}.run", ns.as_str());
            let run = Run::write(&self.dir, &name, memtable)?;
            space.runs.push(Arc::new(run));
            space.mem_bytes = 0;
        }
        inner.next_seq = seq + 1;
        Self::write_manifest_to(&self.dir, inner)?;

        if inner.spaces.values().all(|s| s.memtable.is_empty()) {
            inner.wal.reset()?;
        }
        info!(dir = %self.dir.display(), ns = ns.as_str(), seq, "flushed memtable");
        Ok(Some(StoreEvent::FlushCompleted(ns)))
    }

    fn compact_space(
        &self,
        inner: &mut Inner,
        ns: Namespace,
        now: u64,
        events: &mut Vec<StoreEvent>,
    ) -> Result<bool, StorageError> {
        let seq = inner.next_seq;
        let (merged, old_files) = {
            let Some(space) = inner.spaces.get_mut(&ns) else {
                return Ok(false);
            };
            if space.runs.is_empty() {
                return Ok(false);
            }
            let mut merged: BTreeMap<Vec<u8>, Slot> = BTreeMap::new();
            for run in &space.runs {
                for (k, slot) in &run.entries {
                    merged.insert(k.clone(), slot.clone());
                }
            }
            merged.retain(|_, slot| match slot {
                None => false,
                Some(stored) => {
                    !(self.opts.ttl_enabled()
                        && ns == Namespace::Data
                        && codec::ttl_expired(stored, self.opts.ttl_seconds, now))
                }
            });
            let old_files: Vec<String> = space.runs.iter().map(|r| r.name.clone()).collect();
            (merged, old_files)
        };

        let new_runs = if merged.is_empty() {
            Vec::new()
        } else {
            let name = format!("{}-{seq:06}.run", ns.as_str());
            vec![Arc::new(Run::write(&self.dir, &name, merged)?)]
        };
        inner.next_seq = seq + 1;
        if let Some(space) = inner.spaces.get_mut(&ns) {
            space.runs = new_runs;
        }
        Self::write_manifest_to(&self.dir, inner)?;
        for file in old_files {
            if let Err(e) = std::fs::remove_file(self.dir.join(&file)) {
                warn!(file, error = %e, "failed to remove compacted run");
                events.push(StoreEvent::BackgroundError(format!(
                    "removing compacted run {file}: {e}"
                )));
            }
        }
        info!(dir = %self.dir.display(), ns = ns.as_str(), "compacted namespace");
        Ok(true)
    }

    fn rewrite_runs_excluding(
        &self,
        inner: &mut Inner,
        ns: Namespace,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<(), StorageError> {
        let mut next_seq = inner.next_seq;
        let mut removed_files = Vec::new();
        let mut rewritten = false;
        {
            let Some(space) = inner.spaces.get_mut(&ns) else {
                return Ok(());
            };
            let mut new_runs = Vec::with_capacity(space.runs.len());
            for run in space.runs.drain(..) {
                let overlap = run
                    .entries
                    .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
                    .next()
                    .is_some();
                if !overlap {
                    new_runs.push(run);
                    continue;
                }
                rewritten = true;
                let filtered: BTreeMap<Vec<u8>, Slot> = run
                    .entries
                    .iter()
                    .filter(|(k, _)| (k.as_slice() < lo) || (k.as_slice() >= hi))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                removed_files.push(run.name.clone());
                if !filtered.is_empty() {
                    let name = format!("{}-{next_seq:06}.run", ns.as_str());
                    next_seq += 1;
                    new_runs.push(Arc::new(Run::write(&self.dir, &name, filtered)?));
                }
            }
            space.runs = new_runs;
        }
        inner.next_seq = next_seq;
        if rewritten {
            Self::write_manifest_to(&self.dir, inner)?;
            for file in removed_files {
                if let Err(e) = std::fs::remove_file(self.dir.join(&file)) {
                    warn!(file, error = %e, "failed to remove rewritten run");
                }
            }
        }
        Ok(())
    }

    fn load_manifest(dir: &Path) -> Result<Manifest, StorageError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes the manifest atomically: tmp file, fsync, rename, dir fsync.
    fn write_manifest_to(dir: &Path, inner: &Inner) -> Result<(), StorageError> {
        let manifest = Manifest {
            next_seq: inner.next_seq,
            runs: inner
                .spaces
                .iter()
                .map(|(ns, space)| {
                    let metas = space
                        .runs
                        .iter()
                        .map(|r| RunMeta {
                            file: r.name.clone(),
                            entries: r.len() as u64,
                            bytes: r.file_bytes,
                        })
                        .collect();
                    (ns.as_str().to_string(), metas)
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(&tmp, &json)?;
        std::fs::File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        run::sync_dir(dir)?;
        Ok(())
    }

    fn emit(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        let sink = self.events.lock();
        if let Some(sink) = sink.as_ref() {
            for event in events {
                sink(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open(dir: &Path) -> KvStore {
        KvStore::open(dir, StoreOptions::default()).unwrap()
    }

    fn put_batch(entries: &[(&[u8], &[u8])]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (k, v) in entries {
            batch.put(Namespace::Data, *k, *v);
        }
        batch
    }

    #[test]
    fn test_write_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.write_batch(put_batch(&[(b"k1", b"v1"), (b"k2", b"v2")])).unwrap();
        assert_eq!(store.get(Namespace::Data, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(Namespace::Data, b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get(Namespace::Data, b"k3").unwrap(), None);
    }

    #[test]
    fn test_delete_shadows_flushed_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.write_batch(put_batch(&[(b"k", b"v")])).unwrap();
        store.flush(Namespace::Data).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete(Namespace::Data, b"k".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), None);
    }

    #[test]
    fn test_reopen_replays_wal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.write_batch(put_batch(&[(b"k", b"v")])).unwrap();
            store.close().unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_reopen_after_flush_loads_runs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.write_batch(put_batch(&[(b"k", b"v")])).unwrap();
            store.flush_all().unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_scan_is_ordered_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store
            .write_batch(put_batch(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")]))
            .unwrap();
        store.flush(Namespace::Data).unwrap();
        store.write_batch(put_batch(&[(b"b", b"2b")])).unwrap();

        let range = ScanRange::between(Some(b"b".to_vec()), Some(b"d".to_vec()), true, false);
        let got: Vec<_> = store.scan(Namespace::Data, &range).unwrap().collect();
        assert_eq!(
            got,
            vec![
                (b"b".to_vec(), b"2b".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_scan_is_point_in_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.write_batch(put_batch(&[(b"a", b"1")])).unwrap();
        let scan = store.scan(Namespace::Data, &ScanRange::all()).unwrap();
        store.write_batch(put_batch(&[(b"b", b"2")])).unwrap();

        let got: Vec<_> = scan.collect();
        assert_eq!(got.len(), 1, "iterator must not see writes after creation");
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let mut batch = WriteBatch::new();
        batch.put(Namespace::Data, b"k".to_vec(), b"data".to_vec());
        batch.put(Namespace::Meta, b"k".to_vec(), b"meta".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), Some(b"data".to_vec()));
        assert_eq!(store.get(Namespace::Meta, b"k").unwrap(), Some(b"meta".to_vec()));
    }

    #[test]
    fn test_batch_is_atomic_across_namespaces_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            let mut batch = WriteBatch::new();
            batch.put(Namespace::Data, b"k".to_vec(), b"v".to_vec());
            batch.put(Namespace::Meta, b"clock".to_vec(), b"7".to_vec());
            store.write_batch(batch).unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(Namespace::Meta, b"clock").unwrap(), Some(b"7".to_vec()));
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.write_batch(put_batch(&[(b"a", b"1"), (b"b", b"2")])).unwrap();
        store.flush(Namespace::Data).unwrap();
        let mut batch = WriteBatch::new();
        batch.delete(Namespace::Data, b"a".to_vec());
        store.write_batch(batch).unwrap();

        store.compact().unwrap();

        assert_eq!(store.get(Namespace::Data, b"a").unwrap(), None);
        assert_eq!(store.get(Namespace::Data, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.approximate_count(Namespace::Data).unwrap(), 1);
    }

    #[test]
    fn test_delete_range_spans_memtable_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.write_batch(put_batch(&[(b"a", b"1"), (b"c", b"3")])).unwrap();
        store.flush(Namespace::Data).unwrap();
        store.write_batch(put_batch(&[(b"b", b"2"), (b"d", b"4")])).unwrap();

        store.delete_range(Namespace::Data, b"a", b"d").unwrap();

        assert_eq!(store.get(Namespace::Data, b"a").unwrap(), None);
        assert_eq!(store.get(Namespace::Data, b"b").unwrap(), None);
        assert_eq!(store.get(Namespace::Data, b"c").unwrap(), None);
        assert_eq!(store.get(Namespace::Data, b"d").unwrap(), Some(b"4".to_vec()));
    }

    #[test]
    fn test_delete_range_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.write_batch(put_batch(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")])).unwrap();
            store.flush(Namespace::Data).unwrap();
            store.delete_range(Namespace::Data, b"a", b"c").unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(Namespace::Data, b"a").unwrap(), None);
        assert_eq!(store.get(Namespace::Data, b"b").unwrap(), None);
        assert_eq!(store.get(Namespace::Data, b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_ttl_hides_expired_and_compaction_reclaims() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(
            dir.path(),
            StoreOptions {
                ttl_seconds: 1,
                ..StoreOptions::default()
            },
        )
        .unwrap();

        let mut batch = WriteBatch::new();
        batch.put(Namespace::Data, b"k".to_vec(), b"v".to_vec());
        batch.put(Namespace::Meta, b"clock".to_vec(), b"5".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), Some(b"v".to_vec()));

        std::thread::sleep(std::time::Duration::from_millis(1500));
        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), None);

        store.compact().unwrap();
        assert_eq!(store.get(Namespace::Data, b"k").unwrap(), None);
        assert_eq!(store.approximate_count(Namespace::Data).unwrap(), 0);
        // Meta namespace is exempt from TTL.
        assert_eq!(store.get(Namespace::Meta, b"clock").unwrap(), Some(b"5".to_vec()));
    }

    #[test]
    fn test_image_into_hard_link_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.write_batch(put_batch(&[(b"k1", b"v1"), (b"k2", b"v2")])).unwrap();
        let target = image.path().join("snap");
        store.image_into(&target, ImageMode::HardLink).unwrap();

        // Writes after the image must not leak into it.
        store.write_batch(put_batch(&[(b"k3", b"v3")])).unwrap();

        let copy = open(&target);
        assert_eq!(copy.get(Namespace::Data, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(copy.get(Namespace::Data, b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(copy.get(Namespace::Data, b"k3").unwrap(), None);
    }

    #[test]
    fn test_closed_store_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.close().unwrap();

        assert!(matches!(
            store.get(Namespace::Data, b"k"),
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.write_batch(WriteBatch::new()),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn test_flush_event_fires_outside_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let flushes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&flushes);
        store.set_event_sink(Box::new(move |event| {
            if matches!(event, StoreEvent::FlushCompleted(Namespace::Data)) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        store.write_batch(put_batch(&[(b"k", b"v")])).unwrap();
        store.flush(Namespace::Data).unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        // Empty memtable flush emits nothing.
        store.flush(Namespace::Data).unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_approximate_size_zero_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert_eq!(store.approximate_size(Namespace::Data).unwrap(), 0);

        store.write_batch(put_batch(&[(b"k", b"v")])).unwrap();
        assert!(store.approximate_size(Namespace::Data).unwrap() > 0);
    }
}
