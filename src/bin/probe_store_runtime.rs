//! Probe Store Runtime
//!
//! This binary runs the probe store against a live prober:
//! - Starts the SQLite persistence writer
//! - Spawns the maintenance scheduler (flush, expiry, reload, rollup)
//! - Reads probe records from the prober FIFO, re-opening it on EOF
//! - Shuts down cooperatively on CTRL+C
//!
//! The FIFO is opened non-blocking, so a missing prober never parks a
//! thread in `open(2)` and shutdown does not wait for one.
//!
//! Usage:
//!   cargo run --release --bin probe_store_runtime
//!
//! Environment variables (see `ProbeStoreConfig::from_env`):
//!   PROBE_STORE_DB_PATH - SQLite database path
//!   PROBE_STORE_FIFO_PATH - Prober output FIFO
//!   PROBE_STORE_LOOK_AROUND_SECS - Highres retention around loss (default: 10)
//!   RUST_LOG - Log filter (default: info)

use async_trait::async_trait;
use dotenv::dotenv;
use log::{error, info, warn};
use probe_store::probe_store::{
    run_ingestion_until, ConfigReloader, MaintenanceScheduler, ProbeStore, ProbeStoreConfig,
    ProbeStoreError,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::pipe;

const REOPEN_DELAY: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Re-reads `.env` and the environment, reporting changes that need a
/// restart
struct EnvReloader {
    active: ProbeStoreConfig,
}

#[async_trait]
impl ConfigReloader for EnvReloader {
    async fn reload(&self) -> Result<(), ProbeStoreError> {
        dotenv().ok();
        let fresh = ProbeStoreConfig::from_env();
        fresh.validate()?;

        let changed = fresh.db_path != self.active.db_path
            || fresh.fifo_path != self.active.fifo_path
            || fresh.look_around_secs != self.active.look_around_secs
            || fresh.probe_timeout_secs != self.active.probe_timeout_secs
            || fresh.processing_slack_secs != self.active.processing_slack_secs;
        if changed {
            warn!("⚠️  Configuration changed on disk; restart probe_store_runtime to apply");
        } else {
            info!("🔄 Configuration reloaded (unchanged)");
        }
        Ok(())
    }
}

/// Resolves once `stop` is set
async fn stopped(stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(STOP_POLL).await;
    }
}

/// Read the FIFO until stopped; EOF means no prober is attached
async fn ingest_fifo(fifo_path: PathBuf, store: Arc<ProbeStore>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match pipe::OpenOptions::new().open_receiver(&fifo_path) {
            Ok(receiver) => {
                log::debug!("📥 Reading probes from {}", fifo_path.display());
                tokio::select! {
                    result = run_ingestion_until(receiver, &store, &stop) => {
                        if let Err(e) = result {
                            error!("❌ Ingestion failed: {}", e);
                        }
                    }
                    _ = stopped(&stop) => break,
                }
            }
            Err(e) => {
                warn!("⚠️  Cannot open {}: {}", fifo_path.display(), e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(REOPEN_DELAY) => {}
            _ = stopped(&stop) => break,
        }
    }
    info!("🛑 FIFO ingestion stopped");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Probe Store Runtime");

    let config = ProbeStoreConfig::from_env();
    config.validate()?;

    info!("   ├─ Database: {}", config.db_path.display());
    info!("   ├─ FIFO: {}", config.fifo_path.display());
    info!(
        "   ├─ Look-around: {}s (timeout {}s, slack {}s)",
        config.look_around_secs, config.probe_timeout_secs, config.processing_slack_secs
    );
    info!("   ├─ Flush interval: {}ms", config.flush_interval_ms);
    info!("   ├─ Commit threshold: {} statements", config.commit_threshold);
    info!("   └─ Suppress down sessions: {}", config.suppress_down_sessions);

    let store = Arc::new(ProbeStore::open(config.clone())?);

    let reloader = Arc::new(EnvReloader {
        active: config.clone(),
    });
    let scheduler = MaintenanceScheduler::new(store.clone(), Some(reloader));
    let stop = scheduler.stop_handle();
    let mut scheduler_handle = tokio::spawn(scheduler.run());
    info!("   └─ ✅ Maintenance scheduler spawned");

    let ingestion_handle = tokio::spawn(ingest_fifo(
        config.fifo_path.clone(),
        store.clone(),
        stop.clone(),
    ));
    info!("   └─ ✅ Ingestion task spawned");

    info!("🔄 Press CTRL+C to shutdown gracefully");

    let mut scheduler_done = false;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
        }
        result = &mut scheduler_handle => {
            scheduler_done = true;
            match result {
                Ok(Ok(())) => info!("Maintenance scheduler finished"),
                Ok(Err(e)) => error!("❌ Maintenance scheduler failed: {}", e),
                Err(e) => error!("❌ Maintenance scheduler task panicked: {}", e),
            }
        }
    }

    stop.store(true, Ordering::Relaxed);

    if tokio::time::timeout(SHUTDOWN_GRACE, ingestion_handle).await.is_err() {
        warn!("⚠️  Ingestion did not stop in time");
    }

    if !scheduler_done {
        match tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await {
            Ok(Ok(Err(e))) => error!("❌ Maintenance scheduler failed: {}", e),
            Ok(_) => {}
            Err(_) => warn!("⚠️  Maintenance scheduler did not stop in time"),
        }
    }

    let now = store.now();
    store.flush(now);
    store.commit();

    match store.get_storage_statistics().await {
        Ok(stats) => info!("📊 Storage statistics: {}", serde_json::to_string(&stats)?),
        Err(e) => warn!("⚠️  Storage statistics unavailable: {}", e),
    }

    let closing = store.clone();
    let writer_stats = tokio::task::spawn_blocking(move || closing.close()).await??;
    info!("📊 Writer statistics: {}", serde_json::to_string(&writer_stats)?);

    info!("✅ Probe store runtime stopped");
    Ok(())
}
