//! Probe store facade
//!
//! Owns the sequencer, the aggregator and the event detector behind a single
//! mutex, plus the persistence writer. Ingestion, the maintenance scheduler
//! and query handlers all go through `ProbeStore`.
//!
//! ## Data flow
//!
//! ```text
//! ProbeRecord
//!     ↓ add()
//! Sequencer ──(paired)──→ open highres bucket of the creation second
//!     ↓ flush(now), once the window is past timeout + slack
//! HighresSnapshot ──→ lowres bucket + backlog
//!     ↓                        ↓ rollup(cutoff)
//! EventDetector            300 s rows
//!     ↓
//! 1 s rows around loss
//! ```
//!
//! Statistics are computed outside the lock; only swaps and folds hold it.

use super::aggregator::DualResolutionAggregator;
use super::bucket::AggregateBucket;
use super::config::ProbeStoreConfig;
use super::db::{
    self, PersistenceWriter, WriterOptions, WriterStats, AGGREGATE_COLUMNS, DELETE_EXPIRED_SQL,
    INSERT_AGGREGATE_SQL, LATE_DUPLICATE_SQL,
};
use super::detector::{EventDetector, LinkState};
use super::error::ProbeStoreError;
use super::sequencer::{Admission, Sequencer};
use super::types::{
    IntervalAggregate, PersistedAggregate, ProbeRecord, Resolution, SessionId, NANOS_PER_SEC,
};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-memory state guarded by the store lock
pub struct StoreState {
    pub sequencer: Sequencer,
    pub aggregator: DualResolutionAggregator,
    pub detector: EventDetector,
}

/// Operational snapshot of the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStatistics {
    pub sessions: usize,
    pub pending_probes: usize,
    pub open_highres_buckets: usize,
    pub lowres_buckets: usize,
    pub backlog_windows: usize,
    pub backlog_snapshots: usize,
    pub highres_rows: u64,
    pub lowres_rows: u64,
    pub events_detected: u64,
    pub statements_issued: u64,
    pub late_duplicates: u64,
    /// Probes paired after their highres window closed
    pub late_probes: u64,
    pub writer_healthy: bool,
    pub link_states: BTreeMap<SessionId, LinkState>,
}

/// Outcome of one `flush`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Every highres window ending at or before this is closed
    pub closed_through: i64,
    pub snapshots: usize,
    pub highres_persisted: usize,
}

pub struct ProbeStore {
    state: Mutex<StoreState>,
    writer: PersistenceWriter,
    config: ProbeStoreConfig,
    statements_issued: AtomicU64,
    late_duplicates: AtomicU64,

    /// Timestamp function (for testing with mock time), nanoseconds
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

fn wall_clock_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl ProbeStore {
    /// Open the store with the system clock
    ///
    /// Starts the persistence writer; the database connection is
    /// established in the background.
    pub fn open(config: ProbeStoreConfig) -> Result<Self, ProbeStoreError> {
        Self::open_with_timestamp_fn(config, Box::new(wall_clock_ns))
    }

    /// Open the store with a custom timestamp function
    ///
    /// Used for testing with deterministic timestamps.
    ///
    /// Arguments:
    /// - `config`: store configuration
    /// - `now_fn`: function returning UNIX time in nanoseconds
    pub fn open_with_timestamp_fn(
        config: ProbeStoreConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Self, ProbeStoreError> {
        config.validate()?;

        let writer = PersistenceWriter::start(WriterOptions {
            db_path: config.db_path.clone(),
            commit_threshold: config.commit_threshold,
            connect_retry: config.connect_retry(),
        })?;

        let state = StoreState {
            sequencer: Sequencer::new(config.wraparound_gap),
            aggregator: DualResolutionAggregator::new(
                config.resolution_delay_ns(),
                config.backlog_horizon_ns(),
            ),
            detector: EventDetector::new(
                config.look_around_ns(),
                config.resolution_delay_ns(),
                config.suppress_down_sessions,
            ),
        };

        log::info!(
            "✅ Probe store opened (look-around {}s, timeout {}s, slack {}s)",
            config.look_around_secs,
            config.probe_timeout_secs,
            config.processing_slack_secs
        );

        Ok(Self {
            state: Mutex::new(state),
            writer,
            config,
            statements_issued: AtomicU64::new(0),
            late_duplicates: AtomicU64::new(0),
            now_fn,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&self, sql: &str, params: Vec<Value>) {
        self.statements_issued.fetch_add(1, Ordering::Relaxed);
        self.writer.execute(sql, params);
    }

    fn persist(&self, row: &PersistedAggregate) {
        self.execute(INSERT_AGGREGATE_SQL, db::insert_params(row));
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn config(&self) -> &ProbeStoreConfig {
        &self.config
    }

    /// Sequence one decoded record and feed completed probes to the
    /// aggregator
    pub fn add(&self, record: ProbeRecord) {
        let late_duplicate = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.sequencer.add(record) {
                Admission::Accepted(probes) => {
                    for probe in &probes {
                        state.aggregator.add(probe);
                    }
                    None
                }
                Admission::LateDuplicate(dup) => {
                    let window_closed = state.aggregator.add_duplicate(dup.session_id, dup.created);
                    Some((dup, window_closed))
                }
                Admission::Discarded => {
                    log::debug!(
                        "Duplicate for unknown session {} (seq {}) discarded",
                        record.session_id,
                        record.seq
                    );
                    None
                }
                Admission::DuplicateCounted => None,
            }
        };

        let Some((dup, window_closed)) = late_duplicate else {
            return;
        };
        self.late_duplicates.fetch_add(1, Ordering::Relaxed);
        // Rows written from the closed window need the count too
        if window_closed {
            self.execute(
                LATE_DUPLICATE_SQL,
                vec![
                    Value::Integer(dup.session_id as i64),
                    Value::Integer(Resolution::Highres.window_start(dup.created)),
                    Value::Integer(Resolution::Lowres.window_start(dup.created)),
                ],
            );
        }
    }

    /// Close due highres windows and run event detection
    ///
    /// Arguments:
    /// - `now`: flush time; windows that ended at least probe timeout +
    ///   slack before `now` (floored to the second) are closed
    pub fn flush(&self, now: i64) -> FlushReport {
        let closed = self.lock().aggregator.take_highres(now);
        let Some(closed) = closed else {
            return FlushReport::default();
        };
        let closed_through = closed.closed_through;

        let snapshots = DualResolutionAggregator::compute_snapshots(closed);
        let snapshot_count = snapshots.len();

        let selected = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.aggregator.store_snapshots(snapshots);
            let selected = state.detector.detect(now, &state.aggregator);
            state.aggregator.prune_backlog(now);
            selected
        };

        for snapshot in &selected {
            self.persist(&PersistedAggregate {
                session_id: snapshot.session_id,
                resolution: Resolution::Highres,
                window_start: snapshot.window_start,
                stats: snapshot.stats,
            });
        }

        if !selected.is_empty() {
            log::debug!("💾 Persisting {} highres windows around loss", selected.len());
        }

        FlushReport {
            closed_through,
            snapshots: snapshot_count,
            highres_persisted: selected.len(),
        }
    }

    /// Persist and discard lowres windows that ended at or before `cutoff`
    pub fn rollup(&self, cutoff: i64) -> usize {
        let due = self.lock().aggregator.take_lowres_due(cutoff);
        let count = due.len();

        for mut window in due {
            let stats = window.bucket.compute_stats();
            self.persist(&PersistedAggregate {
                session_id: window.session_id,
                resolution: Resolution::Lowres,
                window_start: window.window_start,
                stats,
            });
        }

        if count > 0 {
            log::info!("📊 Rolled up {} lowres windows (cutoff {})", count, cutoff);
        }
        count
    }

    /// Delete durable rows past their retention
    pub fn delete_expired(&self, now: i64) {
        let highres_cutoff = now.saturating_sub(self.config.highres_retention_ns());
        let lowres_cutoff = now.saturating_sub(self.config.lowres_retention_ns());

        self.execute(
            DELETE_EXPIRED_SQL,
            vec![Value::Integer(Resolution::Highres.seconds()), Value::Integer(highres_cutoff)],
        );
        self.execute(
            DELETE_EXPIRED_SQL,
            vec![Value::Integer(Resolution::Lowres.seconds()), Value::Integer(lowres_cutoff)],
        );
        log::info!("🧹 Deleting expired aggregates");
    }

    pub fn commit(&self) {
        self.writer.commit();
    }

    /// Discard in-flight sequencing state for all sessions
    pub fn flush_queue(&self) -> usize {
        let dropped = self.lock().sequencer.clear();
        log::info!("🔄 Sequencing state discarded ({} pending probes dropped)", dropped);
        dropped
    }

    pub fn is_healthy(&self) -> bool {
        self.writer.is_healthy()
    }

    #[cfg(test)]
    pub(crate) fn mark_connection_lost(&self) {
        self.writer.mark_connection_lost();
    }

    /// Commit outstanding work and stop the writer (blocking)
    pub fn close(&self) -> Result<WriterStats, ProbeStoreError> {
        self.writer.close()
    }

    /// Per sub-interval statistics from the in-memory highres backlog
    ///
    /// Sub-intervals are `[start, start + interval)`, ..., the last one ends
    /// at `end`. All bounds are in seconds. Only sub-intervals between the
    /// first and the last one holding backlog data are reported; gaps in
    /// between carry zeroed statistics.
    pub fn get_aggregate(
        &self,
        session_id: SessionId,
        interval_seconds: i64,
        start: i64,
        end: i64,
    ) -> Vec<IntervalAggregate> {
        if interval_seconds <= 0 || end <= start {
            return Vec::new();
        }

        // (sub-interval index, samples), copied out under the lock
        let samples: Vec<(i64, AggregateBucket)> = {
            let state = self.lock();
            let range = start.saturating_mul(NANOS_PER_SEC)..end.saturating_mul(NANOS_PER_SEC);
            state
                .aggregator
                .session_snapshots(session_id)
                .filter(|snapshot| range.contains(&snapshot.window_start))
                .map(|snapshot| {
                    let offset = snapshot.window_start.div_euclid(NANOS_PER_SEC) - start;
                    (offset / interval_seconds, snapshot.bucket.clone())
                })
                .collect()
        };

        let (Some(first), Some(last)) = (
            samples.iter().map(|(index, _)| *index).min(),
            samples.iter().map(|(index, _)| *index).max(),
        ) else {
            return Vec::new();
        };

        let mut buckets: Vec<(i64, AggregateBucket)> = (first..=last)
            .map(|index| (start + index * interval_seconds, AggregateBucket::new()))
            .collect();
        for (index, bucket) in &samples {
            if let Some((_, merged)) = buckets.get_mut((index - first) as usize) {
                merged.merge(bucket);
            }
        }

        buckets
            .into_iter()
            .map(|(start, mut bucket)| {
                let stats = bucket.compute_stats();
                IntervalAggregate {
                    start,
                    counters: stats.counters,
                    rtt: stats.rtt.unwrap_or_default(),
                    delay_variation: stats.delay_variation.unwrap_or_default(),
                }
            })
            .collect()
    }

    async fn select_aggregates(&self, sql: String, params: Vec<Value>) -> Result<Vec<PersistedAggregate>, ProbeStoreError> {
        let rows = self.writer.select(sql, params).await?;
        Ok(rows.iter().filter_map(|row| db::row_to_aggregate(row)).collect())
    }

    /// The `n` most recent persisted 300 s rows, oldest first
    pub async fn get_last_lowres(&self, session_id: SessionId, n: usize) -> Result<Vec<PersistedAggregate>, ProbeStoreError> {
        let sql = format!(
            "SELECT {} FROM aggregates WHERE session_id = ?1 AND resolution_seconds = ?2
             ORDER BY window_start_ns DESC LIMIT ?3",
            AGGREGATE_COLUMNS
        );
        let mut rows = self
            .select_aggregates(
                sql,
                vec![
                    Value::Integer(session_id as i64),
                    Value::Integer(Resolution::Lowres.seconds()),
                    Value::Integer(n as i64),
                ],
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }

    /// The `n` most recent finished 1 s windows, oldest first
    ///
    /// A backlog window is finished once it ended at least one probe timeout
    /// ago. Older windows come from persisted 1 s rows.
    pub async fn get_last_highres(&self, session_id: SessionId, n: usize) -> Result<Vec<PersistedAggregate>, ProbeStoreError> {
        let finished_before = self.now() - self.config.probe_timeout_ns();

        let mut recent: Vec<PersistedAggregate> = {
            let state = self.lock();
            state
                .aggregator
                .session_snapshots(session_id)
                .filter(|s| s.window_end <= finished_before)
                .map(|s| PersistedAggregate {
                    session_id,
                    resolution: Resolution::Highres,
                    window_start: s.window_start,
                    stats: s.stats,
                })
                .collect()
        };
        if recent.len() >= n {
            return Ok(recent.split_off(recent.len() - n));
        }

        let oldest = recent.first().map(|r| r.window_start).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {} FROM aggregates
             WHERE session_id = ?1 AND resolution_seconds = ?2 AND window_start_ns < ?3
             ORDER BY window_start_ns DESC LIMIT ?4",
            AGGREGATE_COLUMNS
        );
        let mut persisted = self
            .select_aggregates(
                sql,
                vec![
                    Value::Integer(session_id as i64),
                    Value::Integer(Resolution::Highres.seconds()),
                    Value::Integer(oldest),
                    Value::Integer((n - recent.len()) as i64),
                ],
            )
            .await?;
        persisted.reverse();
        persisted.extend(recent);
        Ok(persisted)
    }

    /// The `n` most recent persisted rows of any resolution, oldest first
    pub async fn get_last_dyn_aggregate(
        &self,
        session_id: SessionId,
        n: usize,
    ) -> Result<Vec<PersistedAggregate>, ProbeStoreError> {
        let sql = format!(
            "SELECT {} FROM aggregates WHERE session_id = ?1
             ORDER BY window_start_ns DESC, resolution_seconds DESC LIMIT ?2",
            AGGREGATE_COLUMNS
        );
        let mut rows = self
            .select_aggregates(
                sql,
                vec![Value::Integer(session_id as i64), Value::Integer(n as i64)],
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Sessions with in-memory or durable data, ascending
    pub async fn current_sessions(&self) -> Result<Vec<SessionId>, ProbeStoreError> {
        let mut sessions: BTreeSet<SessionId> = {
            let state = self.lock();
            let mut ids = state.aggregator.session_ids();
            ids.extend(state.sequencer.session_ids());
            ids
        };

        let rows = self
            .writer
            .select("SELECT DISTINCT session_id FROM aggregates", vec![])
            .await?;
        for row in rows {
            if let Some(Value::Integer(id)) = row.first() {
                sessions.insert(*id as SessionId);
            }
        }

        Ok(sessions.into_iter().collect())
    }

    pub async fn get_storage_statistics(&self) -> Result<StorageStatistics, ProbeStoreError> {
        let mut stats = {
            let state = self.lock();
            let mut sessions = state.aggregator.session_ids();
            sessions.extend(state.sequencer.session_ids());
            StorageStatistics {
                sessions: sessions.len(),
                pending_probes: state.sequencer.pending_probes(),
                open_highres_buckets: state.aggregator.open_highres_count(),
                lowres_buckets: state.aggregator.lowres_bucket_count(),
                backlog_windows: state.aggregator.backlog_windows(),
                backlog_snapshots: state.aggregator.backlog_snapshots(),
                events_detected: state.detector.events_detected(),
                late_probes: state.aggregator.late_probes(),
                link_states: state
                    .detector
                    .link_states()
                    .iter()
                    .map(|(id, link)| (*id, *link))
                    .collect(),
                ..Default::default()
            }
        };

        stats.statements_issued = self.statements_issued.load(Ordering::Relaxed);
        stats.late_duplicates = self.late_duplicates.load(Ordering::Relaxed);
        stats.writer_healthy = self.writer.is_healthy();

        let rows = self
            .writer
            .select(
                "SELECT resolution_seconds, COUNT(*) FROM aggregates GROUP BY resolution_seconds",
                vec![],
            )
            .await?;
        for row in rows {
            match (row.first(), row.get(1)) {
                (Some(Value::Integer(1)), Some(Value::Integer(count))) => stats.highres_rows = *count as u64,
                (Some(Value::Integer(300)), Some(Value::Integer(count))) => stats.lowres_rows = *count as u64,
                _ => {}
            }
        }

        Ok(stats)
    }
}
