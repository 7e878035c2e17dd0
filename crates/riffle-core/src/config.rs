//! Configuration for a storage core.

use std::path::PathBuf;

/// Options recognized by a [`crate::StorageCore`].
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Filesystem root of the core. Created on first start, survives
    /// restarts, and is never deleted by the core itself.
    pub db_path: PathBuf,
    /// TTL for user data in seconds; values at or below 0 disable TTL.
    pub ttl_seconds: i64,
    /// Fsync every atomic batch.
    pub sync_writes: bool,
    /// Prefer hard-link checkpoints (`true`, default) over full-copy
    /// backups (`false`). Both satisfy the same snapshot contracts.
    pub fast_snapshot: bool,
    /// Periodically log approximate count/size of the data namespace.
    pub open_statistics_collector: bool,
    /// Interval for the statistics collector.
    pub statistics_callback_interval_seconds: u64,
    /// Optional JSON tuning file for the data store engine.
    pub db_options_file: Option<PathBuf>,
    /// Optional JSON tuning file for the instruction log engine.
    pub log_options_file: Option<PathBuf>,
}

impl CoreOptions {
    /// Options rooted at `db_path` with defaults everywhere else.
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ttl_seconds: 0,
            sync_writes: false,
            fast_snapshot: true,
            open_statistics_collector: false,
            statistics_callback_interval_seconds: 600,
            db_options_file: None,
            log_options_file: None,
        }
    }

    /// Effective TTL in seconds, 0 when disabled.
    #[must_use]
    pub fn effective_ttl(&self) -> u64 {
        u64::try_from(self.ttl_seconds).unwrap_or(0)
    }
}
