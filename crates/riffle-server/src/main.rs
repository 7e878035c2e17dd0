//! Standalone Riffle core server.
//!
//! Opens one storage core and serves its replication endpoint. Useful for
//! running a follower that primaries can transfer snapshots to, and as the
//! smallest deployable unit for manual testing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riffle_core::{CoreId, CoreMeta, CoreOptions, Location, MpuId, NoTransport, StorageCore};
use riffle_net::CoreServer;

/// Riffle - replicated per-core storage engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Core root directory
    #[arg(long)]
    root: PathBuf,

    /// Replica group id
    #[arg(long, default_value_t = 1)]
    mpu: u64,

    /// Core id within the group
    #[arg(long, default_value_t = 1)]
    core: u64,

    /// Core label (names threads and log spans)
    #[arg(long, default_value = "riffle-core")]
    label: String,

    /// Bind address for the replication endpoint
    #[arg(long, default_value = "127.0.0.1:7420")]
    bind: String,

    /// TTL for user data in seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    ttl_seconds: i64,

    /// Fsync every atomic batch
    #[arg(long)]
    sync_writes: bool,

    /// Use full-copy backups instead of hard-link checkpoints
    #[arg(long)]
    full_backups: bool,

    /// Periodically log approximate count/size
    #[arg(long)]
    statistics: bool,

    /// Statistics interval in seconds
    #[arg(long, default_value_t = 600)]
    statistics_interval: u64,

    /// Optional JSON tuning file for the data store engine
    #[arg(long)]
    db_options_file: Option<PathBuf>,

    /// Optional JSON tuning file for the instruction log engine
    #[arg(long)]
    log_options_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("riffle={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Riffle core server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let bind: std::net::SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", args.bind))?;

    let meta = CoreMeta::new(
        MpuId(args.mpu),
        CoreId(args.core),
        args.label.clone(),
        Location::new(bind.ip().to_string(), bind.port()),
    );
    let options = CoreOptions {
        db_path: args.root.clone(),
        ttl_seconds: args.ttl_seconds,
        sync_writes: args.sync_writes,
        fast_snapshot: !args.full_backups,
        open_statistics_collector: args.statistics,
        statistics_callback_interval_seconds: args.statistics_interval,
        db_options_file: args.db_options_file.clone(),
        log_options_file: args.log_options_file.clone(),
    };

    let core = tokio::task::spawn_blocking(move || {
        StorageCore::open(meta, options, Arc::new(NoTransport))
    })
    .await?
    .context("opening storage core")?;

    // TTL reclamation depends on compaction, so schedule it hourly.
    if args.ttl_seconds > 0 {
        let compact_core = Arc::clone(&core);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let core = Arc::clone(&compact_core);
                let outcome = tokio::task::spawn_blocking(move || core.compact()).await;
                if let Ok(Err(e)) = outcome {
                    tracing::error!(error = %e, "scheduled compaction failed");
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let server = CoreServer::new([Arc::clone(&core)]);
    let result = server.serve(listener).await;

    tokio::task::spawn_blocking(move || core.destroy()).await??;
    result.context("replication endpoint failed")
}
