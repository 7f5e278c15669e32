//! Dual-resolution aggregator
//!
//! Paired probes are accounted in the highres (1 s) window of their creation
//! time. A window stays open while probes for it may still arrive, i.e. until
//! its end lies `close_delay` (probe timeout + slack) behind the flush time.
//! A flush closes every such window, computes statistics, folds the result
//! into the 300 s lowres bucket of the same creation time and keeps the
//! statistic-bearing snapshot in a short backlog for the event detector.
//!
//! Flushing is split into three steps so that the expensive part (sorting
//! samples) can run without holding the store lock:
//!
//! ```text
//! take_highres()      [locked]    split off windows that are due
//! compute_snapshots() [unlocked]  sort + statistics
//! store_snapshots()   [locked]    fold into lowres, insert into backlog
//! ```

use super::bucket::AggregateBucket;
use super::types::{AggregateStats, PairedProbe, Resolution, SessionId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A closed, statistic-computed highres bucket
#[derive(Debug, Clone, PartialEq)]
pub struct HighresSnapshot {
    pub session_id: SessionId,
    pub window_start: i64,
    pub window_end: i64,
    /// Raw samples, sorted ascending
    pub bucket: AggregateBucket,
    pub stats: AggregateStats,
}

/// Highres buckets split off by `take_highres`
#[derive(Debug)]
pub struct ClosedWindows {
    /// Every window ending at or before this instant is now closed
    pub closed_through: i64,
    /// `(window_start, session, bucket)`, ascending by window start
    pub buckets: Vec<(i64, SessionId, AggregateBucket)>,
}

/// A lowres bucket whose window is due for rollup
#[derive(Debug)]
pub struct LowresWindow {
    pub session_id: SessionId,
    pub window_start: i64,
    pub bucket: AggregateBucket,
}

pub struct DualResolutionAggregator {
    /// Open highres buckets keyed by window start, then session
    open_highres: BTreeMap<i64, HashMap<SessionId, AggregateBucket>>,
    /// Per session, lowres buckets keyed by aligned window start
    lowres: HashMap<SessionId, BTreeMap<i64, AggregateBucket>>,
    /// Highres snapshots keyed by window end
    backlog: BTreeMap<i64, HashMap<SessionId, HighresSnapshot>>,
    closed_through: Option<i64>,
    /// Lowres windows starting before this were already rolled up
    lowres_rolled_before: Option<i64>,
    close_delay_ns: i64,
    backlog_horizon_ns: i64,
    late_probes: u64,
}

impl DualResolutionAggregator {
    /// Create an aggregator
    ///
    /// Arguments:
    /// - `close_delay_ns`: how long after its end a highres window still
    ///   accepts probes (probe timeout + processing slack)
    /// - `backlog_horizon_ns`: how long a snapshot stays in the backlog after
    ///   the flush that could first resolve it
    pub fn new(close_delay_ns: i64, backlog_horizon_ns: i64) -> Self {
        Self {
            open_highres: BTreeMap::new(),
            lowres: HashMap::new(),
            backlog: BTreeMap::new(),
            closed_through: None,
            lowres_rolled_before: None,
            close_delay_ns,
            backlog_horizon_ns,
            late_probes: 0,
        }
    }

    fn is_closed(&self, window_start: i64) -> bool {
        matches!(self.closed_through, Some(closed) if window_start + Resolution::Highres.period_ns() <= closed)
    }

    fn is_rolled_up(&self, lowres_start: i64) -> bool {
        matches!(self.lowres_rolled_before, Some(rolled) if lowres_start < rolled)
    }

    /// Lowres bucket for a window that has not been rolled up yet
    fn lowres_mut(&mut self, session_id: SessionId, window_start: i64) -> Option<&mut AggregateBucket> {
        let lowres_start = Resolution::Lowres.window_start(window_start);
        if self.is_rolled_up(lowres_start) {
            return None;
        }
        Some(
            self.lowres
                .entry(session_id)
                .or_default()
                .entry(lowres_start)
                .or_default(),
        )
    }

    /// Account a fully paired probe in the highres window of its creation
    /// time
    ///
    /// Returns false when that window was already closed; the probe then
    /// only reaches the lowres bucket, or is dropped if that was rolled up
    /// too.
    pub fn add(&mut self, probe: &PairedProbe) -> bool {
        let record = &probe.record;
        let window_start = Resolution::Highres.window_start(record.created);

        if !self.is_closed(window_start) {
            self.open_highres
                .entry(window_start)
                .or_default()
                .entry(record.session_id)
                .or_default()
                .add(probe);
            return true;
        }

        self.late_probes += 1;
        match self.lowres_mut(record.session_id, window_start) {
            Some(bucket) => {
                bucket.add(probe);
                log::debug!(
                    "Late probe (session {}, seq {}) folded into lowres only",
                    record.session_id,
                    record.seq
                );
            }
            None => log::warn!(
                "⚠️  Dropping late probe (session {}, seq {}): window already rolled up",
                record.session_id,
                record.seq
            ),
        }
        false
    }

    /// Count a duplicate of an already-emitted probe against the windows of
    /// its creation time
    ///
    /// Open highres buckets, backlog snapshots and lowres buckets still in
    /// memory are updated here. Returns true when the highres window was
    /// already closed, so rows persisted from it need updating as well.
    pub fn add_duplicate(&mut self, session_id: SessionId, created: i64) -> bool {
        let window_start = Resolution::Highres.window_start(created);

        if !self.is_closed(window_start) {
            self.open_highres
                .entry(window_start)
                .or_default()
                .entry(session_id)
                .or_default()
                .counters
                .duplicates += 1;
            return false;
        }

        let window_end = window_start + Resolution::Highres.period_ns();
        if let Some(snapshot) = self
            .backlog
            .get_mut(&window_end)
            .and_then(|sessions| sessions.get_mut(&session_id))
        {
            snapshot.bucket.counters.duplicates += 1;
            snapshot.stats.counters.duplicates += 1;
        }
        if let Some(bucket) = self.lowres_mut(session_id, window_start) {
            bucket.counters.duplicates += 1;
        }
        true
    }

    /// Split off every open highres window that ended at least
    /// `close_delay` before `now` (floored to the second)
    ///
    /// Returns `None` when nothing new can close, so repeated calls within
    /// the same second are no-ops.
    pub fn take_highres(&mut self, now: i64) -> Option<ClosedWindows> {
        let closed_through = Resolution::Highres.window_start(now) - self.close_delay_ns;
        if matches!(self.closed_through, Some(last) if last >= closed_through) {
            return None;
        }
        self.closed_through = Some(closed_through);

        // keys > closed_through - period end after closed_through
        let still_open = self
            .open_highres
            .split_off(&(closed_through - Resolution::Highres.period_ns() + 1));
        let due = std::mem::replace(&mut self.open_highres, still_open);

        let buckets = due
            .into_iter()
            .flat_map(|(window_start, sessions)| {
                sessions
                    .into_iter()
                    .map(move |(session_id, bucket)| (window_start, session_id, bucket))
            })
            .filter(|(_, _, bucket)| !bucket.is_empty())
            .collect();

        Some(ClosedWindows {
            closed_through,
            buckets,
        })
    }

    /// Compute statistics for split-off buckets (no shared state touched)
    pub fn compute_snapshots(closed: ClosedWindows) -> Vec<HighresSnapshot> {
        closed
            .buckets
            .into_iter()
            .map(|(window_start, session_id, mut bucket)| {
                let stats = bucket.compute_stats();
                HighresSnapshot {
                    session_id,
                    window_start,
                    window_end: window_start + Resolution::Highres.period_ns(),
                    bucket,
                    stats,
                }
            })
            .collect()
    }

    /// Fold snapshots into lowres and keep them in the backlog
    pub fn store_snapshots(&mut self, snapshots: Vec<HighresSnapshot>) {
        for snapshot in snapshots {
            match self.lowres_mut(snapshot.session_id, snapshot.window_start) {
                Some(bucket) => bucket.merge(&snapshot.bucket),
                None => log::warn!(
                    "⚠️  Highres window {} of session {} closed after its lowres rollup",
                    snapshot.window_start,
                    snapshot.session_id
                ),
            }

            self.backlog
                .entry(snapshot.window_end)
                .or_default()
                .insert(snapshot.session_id, snapshot);
        }
    }

    /// Drop backlog entries that ended before `now - horizon`
    pub fn prune_backlog(&mut self, now: i64) -> usize {
        let keep_from = Resolution::Highres.window_start(now) - self.backlog_horizon_ns;
        let kept = self.backlog.split_off(&keep_from);
        let pruned = std::mem::replace(&mut self.backlog, kept);
        pruned.values().map(HashMap::len).sum()
    }

    /// Single-threaded flush: take, compute, store and prune in one call
    pub fn flush(&mut self, now: i64) -> Vec<HighresSnapshot> {
        let Some(closed) = self.take_highres(now) else {
            return Vec::new();
        };
        let snapshots = Self::compute_snapshots(closed);
        self.store_snapshots(snapshots.clone());
        self.prune_backlog(now);
        snapshots
    }

    /// Remove and return lowres buckets whose window ended at or before
    /// `cutoff`
    pub fn take_lowres_due(&mut self, cutoff: i64) -> Vec<LowresWindow> {
        let period = Resolution::Lowres.period_ns();
        // keys > cutoff - period have not ended yet
        let first_open = cutoff - period + 1;
        let mut due = Vec::new();

        for (&session_id, windows) in self.lowres.iter_mut() {
            let not_due = windows.split_off(&first_open);
            let ready = std::mem::replace(windows, not_due);
            due.extend(ready.into_iter().map(|(window_start, bucket)| LowresWindow {
                session_id,
                window_start,
                bucket,
            }));
        }

        let rolled = self.lowres_rolled_before.get_or_insert(first_open);
        *rolled = (*rolled).max(first_open);

        self.lowres.retain(|_, windows| !windows.is_empty());
        due.sort_by_key(|w| (w.session_id, w.window_start));
        due
    }

    /// Backlog snapshots of one session, ascending by window end
    pub fn session_snapshots(&self, session_id: SessionId) -> impl Iterator<Item = &HighresSnapshot> + '_ {
        self.backlog
            .values()
            .filter_map(move |sessions| sessions.get(&session_id))
    }

    /// Backlog snapshots (all sessions) whose window end lies in `(after, upto]`
    pub fn snapshots_ending_between(&self, after: i64, upto: i64) -> impl Iterator<Item = &HighresSnapshot> + '_ {
        use std::ops::Bound::{Excluded, Included};
        self.backlog
            .range((Excluded(after), Included(upto)))
            .flat_map(|(_, sessions)| sessions.values())
    }

    pub fn session_ids(&self) -> BTreeSet<SessionId> {
        let mut ids = BTreeSet::new();
        for sessions in self.open_highres.values() {
            ids.extend(sessions.keys().copied());
        }
        ids.extend(self.lowres.keys().copied());
        for sessions in self.backlog.values() {
            ids.extend(sessions.keys().copied());
        }
        ids
    }

    /// Open (session, window) highres buckets
    pub fn open_highres_count(&self) -> usize {
        self.open_highres.values().map(HashMap::len).sum()
    }

    pub fn lowres_bucket_count(&self) -> usize {
        self.lowres.values().map(BTreeMap::len).sum()
    }

    pub fn backlog_windows(&self) -> usize {
        self.backlog.len()
    }

    pub fn backlog_snapshots(&self) -> usize {
        self.backlog.values().map(HashMap::len).sum()
    }

    /// Probes that arrived after their highres window closed
    pub fn late_probes(&self) -> u64 {
        self.late_probes
    }

    /// Lowres bucket for a session and window, if still in memory
    pub fn lowres_bucket(&self, session_id: SessionId, window_start: i64) -> Option<&AggregateBucket> {
        self.lowres.get(&session_id)?.get(&window_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe_store::types::{ProbeRecord, ProbeState, NANOS_PER_SEC};

    const T0: i64 = 1_700_000_100 * NANOS_PER_SEC;
    const SEC: i64 = NANOS_PER_SEC;

    fn make_paired(session_id: SessionId, state: ProbeState, rtt: Option<i64>, created: i64) -> PairedProbe {
        let mut probe = PairedProbe::new(ProbeRecord {
            session_id,
            seq: 1,
            state,
            created,
            rtt,
        });
        probe.has_given = true;
        probe.has_gotten = true;
        probe
    }

    fn ok_at(created: i64) -> PairedProbe {
        make_paired(1, ProbeState::Ok, Some(100), created)
    }

    /// 2 s close delay, 22 s backlog
    fn aggregator() -> DualResolutionAggregator {
        DualResolutionAggregator::new(2 * SEC, 22 * SEC)
    }

    #[test]
    fn test_probe_accounted_in_creation_second() {
        // Test: probes created T0..T0+3s flushed late still land in their own windows
        let mut agg = aggregator();
        for k in 0..4 {
            agg.add(&ok_at(T0 + k * SEC + 250_000_000));
        }

        let snapshots = agg.flush(T0 + 10 * SEC);
        let starts: Vec<i64> = snapshots.iter().map(|s| s.window_start).collect();
        assert_eq!(starts, vec![T0, T0 + SEC, T0 + 2 * SEC, T0 + 3 * SEC]);
        assert!(snapshots.iter().all(|s| s.stats.counters.total == 1));
        assert!(snapshots.iter().all(|s| s.window_end == s.window_start + SEC));
        assert_eq!(agg.open_highres_count(), 0);
    }

    #[test]
    fn test_window_waits_for_close_delay() {
        let mut agg = aggregator();
        agg.add(&make_paired(1, ProbeState::Ok, Some(200), T0));
        agg.add(&make_paired(2, ProbeState::Timeout, None, T0 + 100));

        // Window [T0, T0+1s) closes once flush time - 2 s reaches T0+1s
        assert!(agg.flush(T0 + 2 * SEC + 999).is_empty());
        assert_eq!(agg.open_highres_count(), 2);

        // A probe paired late still reaches its window
        agg.add(&make_paired(1, ProbeState::Ok, Some(100), T0 + 500));

        let snapshots = agg.flush(T0 + 3 * SEC);
        assert_eq!(snapshots.len(), 2);
        let s1 = snapshots.iter().find(|s| s.session_id == 1).unwrap();
        assert_eq!(s1.window_start, T0);
        assert_eq!(s1.bucket.rtts, vec![100, 200]);
        assert_eq!(s1.stats.rtt.unwrap().min, 100);

        assert_eq!(agg.backlog_snapshots(), 2);
        assert_eq!(agg.lowres_bucket_count(), 2);
    }

    #[test]
    fn test_flush_without_new_probes_is_idempotent() {
        // Test: flushing twice with no new probes folds nothing and adds no backlog
        let mut agg = aggregator();
        agg.add(&ok_at(T0));
        agg.flush(T0 + 3 * SEC);

        let lowres_start = Resolution::Lowres.window_start(T0);
        let before = agg.lowres_bucket(1, lowres_start).unwrap().clone();
        let backlog_before = agg.backlog_snapshots();

        assert!(agg.flush(T0 + 4 * SEC).is_empty());
        // Same second again: nothing new can close
        assert!(agg.take_highres(T0 + 4 * SEC + 10).is_none());

        assert_eq!(agg.lowres_bucket(1, lowres_start).unwrap(), &before);
        assert_eq!(agg.backlog_snapshots(), backlog_before);
    }

    #[test]
    fn test_late_probe_reaches_lowres_only() {
        let mut agg = aggregator();
        agg.add(&ok_at(T0));
        agg.flush(T0 + 5 * SEC);

        assert!(!agg.add(&ok_at(T0 + 10)));
        assert_eq!(agg.late_probes(), 1);
        assert_eq!(agg.open_highres_count(), 0);

        let bucket = agg.lowres_bucket(1, Resolution::Lowres.window_start(T0)).unwrap();
        assert_eq!(bucket.counters.total, 2);
        // The closed highres snapshot is unchanged
        assert_eq!(agg.session_snapshots(1).next().unwrap().stats.counters.total, 1);
    }

    #[test]
    fn test_lowres_accumulates_raw_samples() {
        let mut agg = aggregator();
        for (i, rtt) in [300, 100, 200].iter().enumerate() {
            let created = T0 + i as i64 * SEC;
            agg.add(&make_paired(1, ProbeState::Ok, Some(*rtt), created));
            agg.flush(created + 3 * SEC);
        }

        let bucket = agg.lowres_bucket(1, Resolution::Lowres.window_start(T0)).unwrap();
        assert_eq!(bucket.counters.total, 3);
        assert_eq!(bucket.rtts.len(), 3);
    }

    #[test]
    fn test_backlog_pruned_after_horizon() {
        let mut agg = aggregator();
        for i in 0..40 {
            agg.add(&ok_at(T0 + i * SEC));
            agg.flush(T0 + (i + 1) * SEC);
        }

        // Closed windows end at T0+1s..T0+38s; kept from T0+40s-22s
        assert_eq!(agg.backlog_windows(), 21);
        let oldest = agg.session_snapshots(1).next().unwrap();
        assert_eq!(oldest.window_end, T0 + 18 * SEC);
    }

    #[test]
    fn test_duplicate_counted_on_creation_window() {
        let mut agg = aggregator();
        agg.add(&make_paired(1, ProbeState::Timeout, None, T0 + 3 * SEC));

        // Window still open: counted in memory only
        assert!(!agg.add_duplicate(1, T0 + 3 * SEC + 7));
        agg.flush(T0 + 6 * SEC);
        let snapshot = agg.session_snapshots(1).next().unwrap();
        assert_eq!(snapshot.window_start, T0 + 3 * SEC);
        assert_eq!(snapshot.stats.counters.duplicates, 1);

        // Window closed: backlog and lowres follow, caller updates rows
        assert!(agg.add_duplicate(1, T0 + 3 * SEC + 9));
        let snapshot = agg.session_snapshots(1).next().unwrap();
        assert_eq!(snapshot.stats.counters.duplicates, 2);
        assert_eq!(snapshot.bucket.counters.duplicates, 2);
        let lowres = agg.lowres_bucket(1, Resolution::Lowres.window_start(T0)).unwrap();
        assert_eq!(lowres.counters.duplicates, 2);
        assert_eq!(lowres.counters.timeout, 1);
    }

    #[test]
    fn test_take_lowres_due_only_finished_windows() {
        let mut agg = aggregator();
        let w0 = Resolution::Lowres.window_start(T0);
        let period = Resolution::Lowres.period_ns();

        agg.add(&ok_at(w0));
        agg.add(&ok_at(w0 + period));
        agg.flush(w0 + period + 5 * SEC);

        assert!(agg.take_lowres_due(w0 + period - 1).is_empty());

        let due = agg.take_lowres_due(w0 + period);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].window_start, w0);
        assert_eq!(agg.lowres_bucket_count(), 1);

        // Rolled-up windows never reopen
        assert!(!agg.add(&ok_at(w0 + SEC)));
        assert!(agg.lowres_bucket(1, w0).is_none());

        let due = agg.take_lowres_due(w0 + 2 * period);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].window_start, w0 + period);
        assert_eq!(agg.lowres_bucket_count(), 0);
    }

    #[test]
    fn test_session_ids_union() {
        let mut agg = aggregator();
        agg.add(&make_paired(1, ProbeState::Ok, Some(1), T0));
        agg.flush(T0 + 3 * SEC);
        agg.add(&make_paired(2, ProbeState::Ok, Some(1), T0 + 3 * SEC));

        let ids: Vec<_> = agg.session_ids().into_iter().collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
