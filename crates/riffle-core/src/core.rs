//! The per-core storage facade.
//!
//! A [`StorageCore`] owns the durable engine, the instruction log and the
//! snapshot store rooted under one directory, serializes control-plane
//! work on a single-threaded runner, and orchestrates snapshot transfer
//! to follower cores through an injected transport.
//!
//! On-disk layout under the core root:
//!
//! ```text
//! {root}/db/                      live data store (data + meta namespaces)
//! {root}/db/wal/                  write-ahead log for db
//! {root}/instruction/             instruction log store
//! {root}/instruction/wal/         wal for the instruction log
//! {root}/checkpoint/local-*/      hard-link checkpoints (fast_snapshot)
//! {root}/checkpoint/remote-checkpoint/   staging slot for an incoming snapshot
//! {root}/backup/                  full-copy snapshots (fast_snapshot = false)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use riffle_storage::{
    codec, BackupSnapshots, CheckpointSnapshots, InstructionLog, KvStore, Namespace, Scan,
    ScanRange, SnapshotError, SnapshotStore, StoreEvent, StoreOptions, StoreTuning, WriteBatch,
    CLOCK_K, LOCAL_PREFIX, REMOTE_STAGING,
};

use crate::config::CoreOptions;
use crate::error::CoreError;
use crate::meta::CoreMeta;
use crate::role::{Role, RoleEvent};
use crate::runner::ControlRunner;
use crate::transport::ReplicaTransport;

/// Snapshots retained by [`StorageCore::backup`].
const SNAPSHOT_RETENTION: usize = 3;

/// Clock interval at which [`StorageCore::clear_clock`] range-compacts the
/// instruction log.
const CLEAR_COMPACT_INTERVAL: u64 = 1_000_000;

/// Coalescing window in front of checkpoint work on the runner.
const COALESCE_DELAY: Duration = Duration::from_secs(1);

/// Prefix of the directory holding the previous live store during a swap.
const DOOMED_PREFIX: &str = "will_delete_soon_";

/// An opaque replayable mutation stamped with its clock.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The logical clock assigned to this mutation.
    pub clock: u64,
    /// Opaque payload; the core persists it for replay but never
    /// interprets it.
    pub payload: Vec<u8>,
}

/// Closure that reconstructs the data-store mutations of a logged
/// instruction during replay, writing them into the supplied writer.
pub type Applier = Box<dyn Fn(&mut Writer, &[u8]) -> Result<(), CoreError> + Send + Sync>;

/// Write-batch builder scoped to one instruction. Handed out by
/// [`StorageCore::writer`] and consumed by [`StorageCore::flush`].
pub struct Writer {
    instruction: Instruction,
    batch: WriteBatch,
}

impl Writer {
    fn new(instruction: Instruction) -> Self {
        Self {
            instruction,
            batch: WriteBatch::new(),
        }
    }

    /// Stages a put into the data namespace.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.batch.put(Namespace::Data, key, value);
    }

    /// Stages a delete in the data namespace.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.batch.delete(Namespace::Data, key);
    }

    /// The instruction this writer is scoped to.
    #[must_use]
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }
}

/// Read handle over the data namespace. Reads bypass the control-plane
/// serializer entirely; scans are snapshot-isolated by the engine.
pub struct Reader {
    store: Arc<KvStore>,
}

impl Reader {
    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] on engine failure.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.store.get(Namespace::Data, key)?)
    }

    /// Ordered range scan with a point-in-time view.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] on engine failure.
    pub fn scan(&self, range: &ScanRange) -> Result<Scan, CoreError> {
        Ok(self.store.scan(Namespace::Data, range)?)
    }
}

/// Maps filesystem failures during swap/recovery into the fatal storage
/// error kind.
fn fs_err(e: std::io::Error) -> CoreError {
    CoreError::Storage(e.into())
}

/// The per-core storage facade.
pub struct StorageCore {
    /// Self-reference handed to engine event sinks and background threads.
    weak: Weak<StorageCore>,
    meta: CoreMeta,
    opts: CoreOptions,
    db_dir: PathBuf,
    db_tuning: StoreTuning,
    db: RwLock<Arc<KvStore>>,
    log: InstructionLog,
    snapshots: Box<dyn SnapshotStore>,
    runner: ControlRunner,
    transport: Arc<dyn ReplicaTransport>,
    role: Mutex<Role>,
    role_listeners: Mutex<Vec<Sender<RoleEvent>>>,
    applier: Mutex<Option<Applier>>,
    /// Writers hold this shared; role transitions take it exclusively to
    /// drain in-flight flushes.
    flush_gate: RwLock<()>,
    destroyed: AtomicBool,
    stats_stop: Arc<AtomicBool>,
    stats_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StorageCore {
    /// Opens (or reopens) the core rooted at `opts.db_path`, recovering
    /// any snapshot swap interrupted by a crash before the engines open.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on I/O failure or on-disk corruption.
    pub fn open(
        meta: CoreMeta,
        opts: CoreOptions,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Result<Arc<Self>, CoreError> {
        let root = opts.db_path.clone();
        std::fs::create_dir_all(&root).map_err(fs_err)?;

        let snap_root = root.join(if opts.fast_snapshot { "checkpoint" } else { "backup" });
        let db_dir = root.join("db");
        Self::recover_interrupted_swap(&root, &db_dir, &snap_root.join(REMOTE_STAGING))?;

        let db_tuning = StoreTuning::load_or_default(opts.db_options_file.as_deref());
        let log_tuning = StoreTuning::load_or_default(opts.log_options_file.as_deref());

        let db = KvStore::open(
            &db_dir,
            Self::store_options_for(&opts, db_tuning.clone()),
        )?;
        let log = InstructionLog::open(root.join("instruction"), log_tuning, opts.sync_writes)?;
        let snapshots: Box<dyn SnapshotStore> = if opts.fast_snapshot {
            Box::new(CheckpointSnapshots::open(&snap_root)?)
        } else {
            Box::new(BackupSnapshots::open(&snap_root)?)
        };
        let runner = ControlRunner::new(&meta.label);

        let core = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            db: RwLock::new(Arc::new(db)),
            log,
            snapshots,
            runner,
            transport,
            role: Mutex::new(Role::Idle),
            role_listeners: Mutex::new(Vec::new()),
            applier: Mutex::new(None),
            flush_gate: RwLock::new(()),
            destroyed: AtomicBool::new(false),
            stats_stop: Arc::new(AtomicBool::new(false)),
            stats_thread: Mutex::new(None),
            db_dir,
            db_tuning,
            meta,
            opts,
        });
        core.install_event_sink();
        core.start_statistics();
        info!(core = %core.meta, root = %root.display(), "opened storage core");
        Ok(core)
    }

    /// This core's identity.
    #[must_use]
    pub fn meta(&self) -> &CoreMeta {
        &self.meta
    }

    /// The current role.
    #[must_use]
    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Registers the replay applier used when this core becomes primary.
    pub fn set_applier(&self, applier: Applier) {
        *self.applier.lock() = Some(applier);
    }

    /// Subscribes to role-change events.
    #[must_use]
    pub fn subscribe_roles(&self) -> Receiver<RoleEvent> {
        let (tx, rx) = unbounded();
        self.role_listeners.lock().push(tx);
        rx
    }

    // ── reads and writes ──

    /// Hands out a read handle. No locking: the engine's scans are
    /// snapshot-isolated.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Destroyed`] after [`StorageCore::destroy`].
    pub fn reader(&self) -> Result<Reader, CoreError> {
        self.ensure_alive()?;
        Ok(Reader { store: self.db() })
    }

    /// Hands out a write-batch builder scoped to `instruction`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Destroyed`] after [`StorageCore::destroy`].
    pub fn writer(&self, instruction: Instruction) -> Result<Writer, CoreError> {
        self.ensure_alive()?;
        Ok(Writer::new(instruction))
    }

    /// Atomically commits the writer's batch together with the clock
    /// update `meta[CLOCK_K] = instruction.clock`. On return the mutation
    /// is durable and [`StorageCore::clocked`] equals the instruction's
    /// clock. Any error is fatal to the core.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotPrimary`] on a follower,
    /// [`CoreError::Storage`] on engine failure.
    pub fn flush(&self, writer: Writer) -> Result<(), CoreError> {
        self.ensure_alive()?;
        {
            let role = *self.role.lock();
            if !role.accepts_writes() {
                return Err(CoreError::NotPrimary(role.as_str()));
            }
        }
        let _gate = self.flush_gate.read();
        self.flush_inner(writer)
    }

    fn flush_inner(&self, writer: Writer) -> Result<(), CoreError> {
        let Writer {
            instruction,
            mut batch,
        } = writer;
        batch.put(
            Namespace::Meta,
            CLOCK_K.to_vec(),
            codec::encode_clock(instruction.clock).to_vec(),
        );
        self.db().write_batch(batch)?;
        Ok(())
    }

    // ── clock and instruction log ──

    /// Records that `clock` has been accepted into the instruction log.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn tick(&self, clock: u64) -> Result<(), CoreError> {
        self.ensure_alive()?;
        Ok(self.log.write_tick(clock)?)
    }

    /// Persists an instruction's raw bytes under its clock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn save_instruction(&self, clock: u64, payload: &[u8]) -> Result<(), CoreError> {
        self.ensure_alive()?;
        Ok(self.log.put(clock, payload)?)
    }

    /// Looks up a logged instruction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn reappear_instruction(&self, clock: u64) -> Result<Option<Vec<u8>>, CoreError> {
        self.ensure_alive()?;
        Ok(self.log.get(clock)?)
    }

    /// Removes the logged instruction at `clock`; at every
    /// million-multiple also range-deletes `[0, clock)` to compact the
    /// log's prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn clear_clock(&self, clock: u64) -> Result<(), CoreError> {
        self.ensure_alive()?;
        self.log.delete(clock)?;
        if clock % CLEAR_COMPACT_INTERVAL == 0 {
            self.log.delete_range(0, clock)?;
        }
        Ok(())
    }

    /// The highest clock durably applied to the data store; 0 when none.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn clocked(&self) -> Result<u64, CoreError> {
        self.ensure_alive()?;
        Ok(self
            .db()
            .get(Namespace::Meta, CLOCK_K)?
            .and_then(|v| codec::decode_clock(&v))
            .unwrap_or(0))
    }

    /// The highest clock accepted into the instruction log; 0 when none.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn clock(&self) -> Result<u64, CoreError> {
        self.ensure_alive()?;
        Ok(self.log.read_tick()?)
    }

    // ── sizing and maintenance ──

    /// Approximate number of live entries in the data namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn approximate_count(&self) -> Result<u64, CoreError> {
        self.ensure_alive()?;
        Ok(self.db().approximate_count(Namespace::Data)?)
    }

    /// Approximate byte size of the data namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn approximate_size(&self) -> Result<u64, CoreError> {
        self.ensure_alive()?;
        Ok(self.db().approximate_size(Namespace::Data)?)
    }

    /// Compacts the data store; intended to be scheduled externally
    /// (hourly in TTL deployments, so expired entries are reclaimed).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn compact(&self) -> Result<(), CoreError> {
        self.ensure_alive()?;
        Ok(self.db().compact()?)
    }

    // ── snapshots and transfer ──

    /// Creates a fresh local snapshot and prunes to the retention count.
    /// Returns the snapshot's directory name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn backup(&self) -> Result<String, CoreError> {
        self.ensure_alive()?;
        let name = self.snapshots.create(&self.db())?;
        self.snapshots.prune(SNAPSHOT_RETENTION)?;
        Ok(name)
    }

    /// Streams this core's latest snapshot to `follower` and tells it to
    /// swap the snapshot in. Blocks on network I/O; run it on a worker
    /// pool, not a request thread. Retryable as a whole on transfer
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transfer`] on RPC or stream failure,
    /// [`CoreError::Snapshot`] when no local snapshot exists.
    pub fn transfer_to(&self, follower: &CoreMeta) -> Result<(), CoreError> {
        self.ensure_alive()?;
        info!(core = %self.meta, follower = %follower, "starting snapshot transfer");
        self.backup()?;

        self.snapshots.set_pinned(true);
        let result = (|| {
            let remote = self.transport.transfer_backup(follower)?;
            let latest = self
                .snapshots
                .latest(LOCAL_PREFIX)?
                .ok_or_else(|| SnapshotError::NotFound(LOCAL_PREFIX.to_string()))?;
            self.transport
                .send_directory(follower, &self.snapshots.path_of(&latest), &remote)?;
            self.transport.apply_backup(follower)?;
            Ok(())
        })();
        self.snapshots.set_pinned(false);

        match &result {
            Ok(()) => info!(core = %self.meta, follower = %follower, "snapshot transfer complete"),
            Err(e) => warn!(core = %self.meta, follower = %follower, error = %e, "snapshot transfer failed"),
        }
        result
    }

    /// Follower-side: prepares the empty staging directory for an
    /// incoming snapshot, discarding any previous staging contents, and
    /// returns its absolute path. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on failure.
    pub fn receive_backup(&self) -> Result<PathBuf, CoreError> {
        self.ensure_alive()?;
        Ok(self.snapshots.stage_receive()?)
    }

    /// Follower-side: atomically adopts the staged snapshot as the live
    /// data store.
    ///
    /// The swap closes the store, renames the live directory aside,
    /// renames the staging directory into place, reopens, then deletes
    /// the old directory. A crash at any point is repaired by the next
    /// [`StorageCore::open`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NothingStaged`] when the staging slot holds
    /// no complete snapshot (the previously applied state is untouched),
    /// [`CoreError::Storage`] on swap failure.
    pub fn apply_backup(&self) -> Result<(), CoreError> {
        self.ensure_alive()?;
        if !self.snapshots.staged_is_complete() {
            return Err(CoreError::NothingStaged);
        }
        let staged = self.snapshots.staged_path();
        let doomed = self
            .opts
            .db_path
            .join(format!("{DOOMED_PREFIX}{REMOTE_STAGING}"));

        {
            let mut slot = self.db.write();
            slot.close()?;
            if doomed.exists() {
                std::fs::remove_dir_all(&doomed).map_err(fs_err)?;
            }
            std::fs::rename(&self.db_dir, &doomed).map_err(fs_err)?;
            std::fs::rename(&staged, &self.db_dir).map_err(fs_err)?;
            let reopened = KvStore::open(
                &self.db_dir,
                Self::store_options_for(&self.opts, self.db_tuning.clone()),
            )?;
            *slot = Arc::new(reopened);
        }
        self.install_event_sink();

        if let Err(e) = std::fs::remove_dir_all(&doomed) {
            warn!(path = %doomed.display(), error = %e, "failed to delete old store after swap");
        }
        info!(core = %self.meta, "applied staged snapshot");
        Ok(())
    }

    // ── roles ──

    /// Delivers an externally decided role transition.
    ///
    /// Becoming primary replays unapplied instructions (those with
    /// `clocked < clock <= tick`) through the registered applier before
    /// the core accepts writes. Leaving primary drains any in-flight
    /// flush before returning.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] when replay fails.
    pub fn handle_role_event(&self, event: RoleEvent) -> Result<(), CoreError> {
        self.ensure_alive()?;
        self.role_listeners
            .lock()
            .retain(|listener| listener.send(event).is_ok());

        let _gate = self.flush_gate.write();
        if matches!(event, RoleEvent::BecamePrimary { .. }) {
            self.replay_unapplied()?;
        }
        let target = event.target_role();
        *self.role.lock() = target;
        info!(core = %self.meta, role = target.as_str(), clock = event.clock(), "role transition");
        Ok(())
    }

    fn replay_unapplied(&self) -> Result<(), CoreError> {
        let clocked = self
            .db()
            .get(Namespace::Meta, CLOCK_K)?
            .and_then(|v| codec::decode_clock(&v))
            .unwrap_or(0);
        let tick = self.log.read_tick()?;
        if tick <= clocked {
            return Ok(());
        }

        let applier = self.applier.lock();
        let Some(applier) = applier.as_ref() else {
            warn!(
                core = %self.meta,
                clocked,
                tick,
                "no applier registered, skipping instruction replay"
            );
            return Ok(());
        };

        let mut replayed = 0u64;
        for clock in (clocked + 1)..=tick {
            let Some(payload) = self.log.get(clock)? else {
                continue;
            };
            let mut writer = Writer::new(Instruction {
                clock,
                payload: payload.clone(),
            });
            applier(&mut writer, &payload)?;
            self.flush_inner(writer)?;
            replayed += 1;
        }
        info!(core = %self.meta, clocked, tick, replayed, "replayed unapplied instructions");
        Ok(())
    }

    // ── lifecycle ──

    /// Closes the engines, the snapshot store and the runner. The on-disk
    /// directory is deliberately NOT deleted, so file handles still held
    /// by in-flight operations cannot leak into removed paths. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] when a final sync fails.
    pub fn destroy(&self) -> Result<(), CoreError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stats_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.stats_thread.lock().take() {
            let _ = thread.join();
        }
        self.runner.shutdown();
        self.db.read().close()?;
        self.log.close()?;
        info!(core = %self.meta, "destroyed core, directory retained");
        Ok(())
    }

    // ── internals ──

    fn ensure_alive(&self) -> Result<(), CoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CoreError::Destroyed);
        }
        Ok(())
    }

    fn db(&self) -> Arc<KvStore> {
        Arc::clone(&self.db.read())
    }

    fn store_options_for(opts: &CoreOptions, tuning: StoreTuning) -> StoreOptions {
        StoreOptions {
            namespaces: vec![Namespace::Data, Namespace::Meta],
            ttl_seconds: opts.effective_ttl(),
            sync_writes: opts.sync_writes,
            tuning,
        }
    }

    /// Wires engine events into the control runner:
    /// data flush -> [1 s coalesce, meta flush, backup];
    /// data compaction -> [1 s coalesce, backup].
    /// These are the only automatic snapshot triggers.
    fn install_event_sink(&self) {
        let weak = self.weak.clone();
        self.db().set_event_sink(Box::new(move |event| {
            if let Some(core) = weak.upgrade() {
                core.on_store_event(&event);
            }
        }));
    }

    fn on_store_event(&self, event: &StoreEvent) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            StoreEvent::FlushCompleted(Namespace::Data) => {
                self.runner.submit_delay(COALESCE_DELAY);
                let weak = self.weak.clone();
                self.runner.submit(move || {
                    let Some(core) = weak.upgrade() else { return };
                    if core.destroyed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(e) = core.db().flush(Namespace::Meta) {
                        error!(core = %core.meta, error = %e, "meta flush failed");
                    }
                });
                self.runner.submit(self.backup_task());
            }
            StoreEvent::CompactionCompleted(Namespace::Data) => {
                self.runner.submit_delay(COALESCE_DELAY);
                self.runner.submit(self.backup_task());
            }
            StoreEvent::BackgroundError(reason) => {
                error!(core = %self.meta, reason = %reason, "storage background error");
            }
            _ => {}
        }
    }

    fn backup_task(&self) -> impl FnOnce() + Send + 'static {
        let weak = self.weak.clone();
        move || {
            let Some(core) = weak.upgrade() else { return };
            if core.destroyed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = core.backup() {
                error!(core = %core.meta, error = %e, "scheduled backup failed");
            }
        }
    }

    fn start_statistics(&self) {
        if !self.opts.open_statistics_collector {
            return;
        }
        let interval =
            Duration::from_secs(self.opts.statistics_callback_interval_seconds.max(1));
        let weak = self.weak.clone();
        let stop = Arc::clone(&self.stats_stop);
        let label = self.meta.label.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{label}-stats"))
            .spawn(move || {
                let step = Duration::from_millis(100);
                'outer: loop {
                    let mut waited = Duration::ZERO;
                    while waited < interval {
                        if stop.load(Ordering::SeqCst) {
                            break 'outer;
                        }
                        std::thread::sleep(step);
                        waited += step;
                    }
                    let Some(core) = weak.upgrade() else { break };
                    match (core.approximate_count(), core.approximate_size()) {
                        (Ok(count), Ok(size)) => {
                            info!(core = label, count, size, "storage statistics");
                        }
                        _ => break,
                    }
                }
            })
            .expect("spawning a named thread only fails on OS resource exhaustion");
        *self.stats_thread.lock() = Some(thread);
    }

    /// Repairs a crash that interrupted [`StorageCore::apply_backup`]:
    /// live store missing with a complete staged snapshot means the swap
    /// rename is completed; live store missing with only a `will_delete_
    /// soon` directory means the old store is renamed back. Leftover
    /// doomed directories next to a live store are deleted.
    fn recover_interrupted_swap(
        root: &Path,
        db_dir: &Path,
        staging: &Path,
    ) -> Result<(), CoreError> {
        if db_dir.exists() {
            for doomed in Self::doomed_dirs(root)? {
                warn!(path = %doomed.display(), "removing leftover directory from interrupted swap");
                std::fs::remove_dir_all(&doomed).map_err(fs_err)?;
            }
            return Ok(());
        }
        if staging.exists() && KvStore::is_store_dir(staging) {
            info!(staging = %staging.display(), "completing interrupted snapshot swap");
            std::fs::rename(staging, db_dir).map_err(fs_err)?;
            for doomed in Self::doomed_dirs(root)? {
                std::fs::remove_dir_all(&doomed).map_err(fs_err)?;
            }
            return Ok(());
        }
        if let Some(doomed) = Self::doomed_dirs(root)?.into_iter().next() {
            info!(path = %doomed.display(), "rolling back interrupted snapshot swap");
            std::fs::rename(&doomed, db_dir).map_err(fs_err)?;
        }
        Ok(())
    }

    fn doomed_dirs(root: &Path) -> Result<Vec<PathBuf>, CoreError> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root).map_err(fs_err)? {
            let entry = entry.map_err(fs_err)?;
            let name = entry.file_name();
            if entry.path().is_dir()
                && name.to_string_lossy().starts_with(DOOMED_PREFIX)
            {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

impl Drop for StorageCore {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(e) = self.destroy() {
                warn!(error = %e, "error destroying core on drop");
            }
        }
    }
}
