//! Consistent on-disk snapshots of a [`KvStore`].
//!
//! Two strategies implement one capability: [`CheckpointSnapshots`]
//! hard-links the store's immutable run files (cheap enough to run after
//! every flush and compaction), [`BackupSnapshots`] copies them in full.
//! Both produce directories that open directly as a [`KvStore`] and both
//! share the naming scheme: `local-<nanos>` for locally created snapshots
//! (the timestamp is strictly monotonic, so name order equals creation
//! order) and the single `remote-checkpoint` staging slot for an incoming
//! snapshot. Names ending in `.tmp` are in-progress and ignored.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::info;

use crate::codec;
use crate::error::SnapshotError;
use crate::kv::{ImageMode, KvStore};

/// Prefix of locally created snapshot directories.
pub const LOCAL_PREFIX: &str = "local-";

/// Name of the staging slot for a snapshot received from a primary.
pub const REMOTE_STAGING: &str = "remote-checkpoint";

const TMP_SUFFIX: &str = ".tmp";

/// Capability for creating, enumerating, pruning and staging snapshots.
///
/// The `pin` flag suppresses pruning while an outbound transfer streams a
/// snapshot, so the directory being sent is never reaped mid-flight.
pub trait SnapshotStore: Send + Sync {
    /// Creates a snapshot of `store`, returning its directory name.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] on I/O or engine failure.
    fn create(&self, store: &KvStore) -> Result<String, SnapshotError>;

    /// Non-`.tmp` snapshot names matching `prefix`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] on directory read failure.
    fn list(&self, prefix: &str) -> Result<Vec<String>, SnapshotError>;

    /// The lexicographically largest snapshot name matching `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] on directory read failure.
    fn latest(&self, prefix: &str) -> Result<Option<String>, SnapshotError>;

    /// Deletes all but the `keep_count` most recent local snapshots.
    /// Suppressed (returns 0) while pinned.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] on delete failure.
    fn prune(&self, keep_count: usize) -> Result<usize, SnapshotError>;

    /// Sets or clears the pin that suppresses pruning.
    fn set_pinned(&self, pinned: bool);

    /// Absolute path of a snapshot directory.
    fn path_of(&self, name: &str) -> PathBuf;

    /// Creates (or recreates, discarding prior contents) the empty
    /// `remote-checkpoint` staging directory and returns its absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] on failure.
    fn stage_receive(&self) -> Result<PathBuf, SnapshotError>;

    /// Absolute path of the staging slot, whether or not it exists.
    fn staged_path(&self) -> PathBuf;

    /// Whether the staging slot holds a complete snapshot image.
    fn staged_is_complete(&self) -> bool;

    /// The snapshot root directory.
    fn root(&self) -> &Path;
}

/// Hard-link snapshots under `<core>/checkpoint/`. The default strategy
/// (`fast_snapshot = true`).
pub struct CheckpointSnapshots {
    shared: Shared,
}

impl CheckpointSnapshots {
    /// Creates the store, making the root directory on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        Ok(Self {
            shared: Shared::open(root.into(), ImageMode::HardLink)?,
        })
    }
}

impl SnapshotStore for CheckpointSnapshots {
    fn create(&self, store: &KvStore) -> Result<String, SnapshotError> {
        self.shared.create(store)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SnapshotError> {
        self.shared.list(prefix)
    }

    fn latest(&self, prefix: &str) -> Result<Option<String>, SnapshotError> {
        self.shared.latest(prefix)
    }

    fn prune(&self, keep_count: usize) -> Result<usize, SnapshotError> {
        self.shared.prune(keep_count)
    }

    fn set_pinned(&self, pinned: bool) {
        self.shared.set_pinned(pinned);
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.shared.path_of(name)
    }

    fn stage_receive(&self) -> Result<PathBuf, SnapshotError> {
        self.shared.stage_receive()
    }

    fn staged_path(&self) -> PathBuf {
        self.shared.path_of(REMOTE_STAGING)
    }

    fn staged_is_complete(&self) -> bool {
        self.shared.staged_is_complete()
    }

    fn root(&self) -> &Path {
        &self.shared.root
    }
}

/// Full-copy snapshots under `<core>/backup/`. The compatibility strategy
/// (`fast_snapshot = false`); same external contracts as
/// [`CheckpointSnapshots`], paid for with a full file copy per snapshot.
pub struct BackupSnapshots {
    shared: Shared,
}

impl BackupSnapshots {
    /// Creates the store, making the root directory on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        Ok(Self {
            shared: Shared::open(root.into(), ImageMode::Copy)?,
        })
    }
}

impl SnapshotStore for BackupSnapshots {
    fn create(&self, store: &KvStore) -> Result<String, SnapshotError> {
        self.shared.create(store)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SnapshotError> {
        self.shared.list(prefix)
    }

    fn latest(&self, prefix: &str) -> Result<Option<String>, SnapshotError> {
        self.shared.latest(prefix)
    }

    fn prune(&self, keep_count: usize) -> Result<usize, SnapshotError> {
        self.shared.prune(keep_count)
    }

    fn set_pinned(&self, pinned: bool) {
        self.shared.set_pinned(pinned);
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.shared.path_of(name)
    }

    fn stage_receive(&self) -> Result<PathBuf, SnapshotError> {
        self.shared.stage_receive()
    }

    fn staged_path(&self) -> PathBuf {
        self.shared.path_of(REMOTE_STAGING)
    }

    fn staged_is_complete(&self) -> bool {
        self.shared.staged_is_complete()
    }

    fn root(&self) -> &Path {
        &self.shared.root
    }
}

struct Shared {
    root: PathBuf,
    mode: ImageMode,
    pinned: Mutex<bool>,
    last_nanos: Mutex<u64>,
}

impl Shared {
    fn open(root: PathBuf, mode: ImageMode) -> Result<Self, SnapshotError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            mode,
            pinned: Mutex::new(false),
            last_nanos: Mutex::new(0),
        })
    }

    /// Next strictly monotonic timestamp for snapshot names.
    fn next_nanos(&self) -> u64 {
        let mut last = self.last_nanos.lock();
        let now = codec::now_nanos().max(*last + 1);
        *last = now;
        now
    }

    fn create(&self, store: &KvStore) -> Result<String, SnapshotError> {
        let name = format!("{LOCAL_PREFIX}{}", self.next_nanos());
        let tmp = self.root.join(format!("{name}{TMP_SUFFIX}"));
        let target = self.root.join(&name);

        store.image_into(&tmp, self.mode)?;
        std::fs::rename(&tmp, &target)?;
        info!(name, root = %self.root.display(), "created snapshot");
        Ok(name)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SnapshotError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) || !name.starts_with(prefix) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn latest(&self, prefix: &str) -> Result<Option<String>, SnapshotError> {
        Ok(self.list(prefix)?.pop())
    }

    fn prune(&self, keep_count: usize) -> Result<usize, SnapshotError> {
        if *self.pinned.lock() {
            return Ok(0);
        }
        let names = self.list(LOCAL_PREFIX)?;
        if names.len() <= keep_count {
            return Ok(0);
        }
        let doomed = names.len() - keep_count;
        let mut removed = 0;
        for name in &names[..doomed] {
            std::fs::remove_dir_all(self.root.join(name))?;
            removed += 1;
        }
        info!(removed, kept = keep_count, "pruned snapshots");
        Ok(removed)
    }

    fn set_pinned(&self, pinned: bool) {
        *self.pinned.lock() = pinned;
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn stage_receive(&self) -> Result<PathBuf, SnapshotError> {
        let staged = self.path_of(REMOTE_STAGING);
        if staged.exists() {
            std::fs::remove_dir_all(&staged)?;
        }
        std::fs::create_dir_all(&staged)?;
        info!(path = %staged.display(), "staged receive slot");
        Ok(staged)
    }

    fn staged_is_complete(&self) -> bool {
        KvStore::is_store_dir(&self.path_of(REMOTE_STAGING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Namespace, StoreOptions, WriteBatch};

    fn store_with_data(dir: &Path) -> KvStore {
        let store = KvStore::open(dir, StoreOptions::default()).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(Namespace::Data, b"k".to_vec(), b"v".to_vec());
        store.write_batch(batch).unwrap();
        store
    }

    #[test]
    fn test_create_names_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_data(&dir.path().join("db"));
        let snaps = CheckpointSnapshots::open(dir.path().join("checkpoint")).unwrap();

        let a = snaps.create(&store).unwrap();
        let b = snaps.create(&store).unwrap();
        assert!(b > a);
        assert_eq!(snaps.latest(LOCAL_PREFIX).unwrap(), Some(b));
    }

    #[test]
    fn test_list_ignores_tmp_and_foreign_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_data(&dir.path().join("db"));
        let snaps = CheckpointSnapshots::open(dir.path().join("checkpoint")).unwrap();

        let name = snaps.create(&store).unwrap();
        std::fs::create_dir_all(snaps.root().join("local-999.tmp")).unwrap();
        std::fs::create_dir_all(snaps.root().join(REMOTE_STAGING)).unwrap();

        assert_eq!(snaps.list(LOCAL_PREFIX).unwrap(), vec![name]);
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_data(&dir.path().join("db"));
        let snaps = CheckpointSnapshots::open(dir.path().join("checkpoint")).unwrap();

        let names: Vec<String> = (0..5).map(|_| snaps.create(&store).unwrap()).collect();
        let removed = snaps.prune(3).unwrap();
        assert_eq!(removed, 2);

        let left = snaps.list(LOCAL_PREFIX).unwrap();
        assert_eq!(left, names[2..].to_vec());
    }

    #[test]
    fn test_pin_suppresses_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_data(&dir.path().join("db"));
        let snaps = CheckpointSnapshots::open(dir.path().join("checkpoint")).unwrap();

        for _ in 0..5 {
            snaps.create(&store).unwrap();
        }
        snaps.set_pinned(true);
        assert_eq!(snaps.prune(0).unwrap(), 0);
        assert_eq!(snaps.list(LOCAL_PREFIX).unwrap().len(), 5);

        snaps.set_pinned(false);
        assert_eq!(snaps.prune(0).unwrap(), 5);
    }

    #[test]
    fn test_snapshot_opens_as_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_data(&dir.path().join("db"));
        let snaps = CheckpointSnapshots::open(dir.path().join("checkpoint")).unwrap();

        let name = snaps.create(&store).unwrap();
        let copy = KvStore::open(snaps.path_of(&name), StoreOptions::default()).unwrap();
        assert_eq!(copy.get(Namespace::Data, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_backup_mode_same_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_data(&dir.path().join("db"));
        let snaps = BackupSnapshots::open(dir.path().join("backup")).unwrap();

        let name = snaps.create(&store).unwrap();
        let copy = KvStore::open(snaps.path_of(&name), StoreOptions::default()).unwrap();
        assert_eq!(copy.get(Namespace::Data, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_stage_receive_discards_prior_contents() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = CheckpointSnapshots::open(dir.path().join("checkpoint")).unwrap();

        let staged = snaps.stage_receive().unwrap();
        std::fs::write(staged.join("partial"), b"junk").unwrap();

        let staged = snaps.stage_receive().unwrap();
        assert!(std::fs::read_dir(&staged).unwrap().next().is_none());
        assert!(!snaps.staged_is_complete());
    }
}
