//! Maintenance scheduler
//!
//! Drives the store on a fixed tick:
//! 1. flush once per elapsed second since the last flushed window, commit
//! 2. delete expired rows every `delete_interval`
//! 3. reload collaborator configuration every `reload_interval`
//! 4. roll up lowres windows whose safety delay has passed
//!
//! Stop is cooperative: the flag is checked before each tick and a tick in
//! progress always completes.

use super::engine::ProbeStore;
use super::error::ProbeStoreError;
use super::types::{Resolution, NANOS_PER_SEC};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

/// Hook for reloading external configuration (session lists, targets)
#[async_trait]
pub trait ConfigReloader: Send + Sync {
    async fn reload(&self) -> Result<(), ProbeStoreError>;
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub flushes: usize,
    pub highres_persisted: usize,
    pub deleted: bool,
    pub reloaded: bool,
    pub rolled_up: usize,
}

pub struct MaintenanceScheduler {
    store: Arc<ProbeStore>,
    reloader: Option<Arc<dyn ConfigReloader>>,
    stop: Arc<AtomicBool>,
    last_flushed: Option<i64>,
    last_delete: i64,
    last_reload: i64,
    last_rollup_cutoff: Option<i64>,
}

impl MaintenanceScheduler {
    /// Create a scheduler; interval timers start at the store's `now`
    pub fn new(store: Arc<ProbeStore>, reloader: Option<Arc<dyn ConfigReloader>>) -> Self {
        let now = store.now();
        Self {
            store,
            reloader,
            stop: Arc::new(AtomicBool::new(false)),
            last_flushed: None,
            last_delete: now,
            last_reload: now,
            last_rollup_cutoff: None,
        }
    }

    /// Flag that ends `run` before its next tick
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run one maintenance tick at time `now`
    ///
    /// Returns `Connectivity` when the writer lost its database; the tick
    /// itself is completed first.
    pub async fn tick(&mut self, now: i64) -> Result<TickReport, ProbeStoreError> {
        let mut report = TickReport::default();
        let config = self.store.config().clone();

        // (a) flush, replaying every missed second
        let target = Resolution::Highres.window_start(now);
        let mut flush_at = match self.last_flushed {
            Some(last) => last + NANOS_PER_SEC,
            None => target,
        };
        while flush_at <= target {
            let flushed = self.store.flush(flush_at);
            report.flushes += 1;
            report.highres_persisted += flushed.highres_persisted;
            flush_at += NANOS_PER_SEC;
        }
        if report.flushes > 0 {
            self.last_flushed = Some(target);
            if report.flushes > 1 {
                log::debug!("⏩ Flush caught up {} windows", report.flushes);
            }
        }
        self.store.commit();

        // (b) expiry
        if now - self.last_delete >= config.delete_interval_ns() {
            self.store.delete_expired(now);
            self.last_delete = now;
            report.deleted = true;
        }

        // (c) collaborator reload
        if now - self.last_reload >= config.reload_interval_ns() {
            if let Some(reloader) = &self.reloader {
                match reloader.reload().await {
                    Ok(()) => report.reloaded = true,
                    Err(e) => log::error!("❌ Maintenance reload failed: {}", e),
                }
            }
            self.last_reload = now;
        }

        // (d) lowres rollup
        let cutoff = Resolution::Lowres.window_start(now - config.safety_delay_ns());
        if self.last_rollup_cutoff != Some(cutoff) {
            report.rolled_up = self.store.rollup(cutoff);
            self.store.commit();
            self.last_rollup_cutoff = Some(cutoff);
        }

        if !self.store.is_healthy() {
            return Err(ProbeStoreError::Connectivity(
                "persistence writer lost its database connection".to_string(),
            ));
        }

        Ok(report)
    }

    /// Tick every `flush_interval` until stopped or the database is lost
    pub async fn run(mut self) -> Result<(), ProbeStoreError> {
        let flush_interval = self.store.config().flush_interval();
        log::info!("⏰ Starting maintenance scheduler (interval: {:?})", flush_interval);

        let mut timer = interval(flush_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            if self.stop.load(Ordering::Relaxed) {
                log::info!("🛑 Maintenance scheduler stopped");
                return Ok(());
            }

            let now = self.store.now();
            if let Err(e) = self.tick(now).await {
                log::error!("❌ Maintenance scheduler exiting: {}", e);
                return Err(e);
            }
        }
    }
}
