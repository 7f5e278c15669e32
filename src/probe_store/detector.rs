//! Loss-triggered highres retention
//!
//! Highres snapshots are only persisted around loss events. A snapshot is
//! *resolved* once every window in its look-around range has closed, i.e.
//! once its window end lies at or before
//! `now - (look_around + probe_timeout + slack)` with `now` floored to the
//! second.
//!
//! On a loss in window `T` of session `S`, every backlog window of `S`
//! starting in `[T - look_around, T + look_around]` is selected for
//! persistence. A per-session high-water mark keeps overlapping events from
//! writing the same window twice.

use super::aggregator::{DualResolutionAggregator, HighresSnapshot};
use super::types::{Counters, Resolution, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reachability of a session's target as seen in its last resolved window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    /// Down when every probe of the window timed out or lost its pong
    pub fn classify(counters: &Counters) -> Self {
        let total = counters.total;
        if total > 0 && (counters.timeout == total || counters.pongloss == total) {
            LinkState::Down
        } else {
            LinkState::Up
        }
    }
}

/// A loss observed in a resolved highres window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossEvent {
    pub session_id: SessionId,
    pub window_start: i64,
}

pub struct EventDetector {
    look_around_ns: i64,
    /// probe timeout + processing slack
    resolution_delay_ns: i64,
    suppress_down: bool,
    last_resolved_cutoff: Option<i64>,
    /// Window start of the newest highres window already selected, per session
    highres_max_saved: HashMap<SessionId, i64>,
    link_states: HashMap<SessionId, LinkState>,
    events_detected: u64,
}

impl EventDetector {
    /// Create a detector
    ///
    /// Arguments:
    /// - `look_around_ns`: half-width of the window persisted around an event
    /// - `resolution_delay_ns`: probe timeout plus processing slack
    /// - `suppress_down`: only fire on state changes or on loss while up
    pub fn new(look_around_ns: i64, resolution_delay_ns: i64, suppress_down: bool) -> Self {
        Self {
            look_around_ns,
            resolution_delay_ns,
            suppress_down,
            last_resolved_cutoff: None,
            highres_max_saved: HashMap::new(),
            link_states: HashMap::new(),
            events_detected: 0,
        }
    }

    pub fn resolved_cutoff(&self, now: i64) -> i64 {
        Resolution::Highres.window_start(now) - (self.look_around_ns + self.resolution_delay_ns)
    }

    /// Examine snapshots resolved since the last call and return the
    /// highres windows to persist, in window order
    pub fn detect(&mut self, now: i64, aggregator: &DualResolutionAggregator) -> Vec<HighresSnapshot> {
        let cutoff = self.resolved_cutoff(now);
        let after = self.last_resolved_cutoff.unwrap_or(i64::MIN);
        if cutoff <= after {
            return Vec::new();
        }
        self.last_resolved_cutoff = Some(cutoff);

        let mut resolved: Vec<(i64, SessionId, Counters)> = aggregator
            .snapshots_ending_between(after, cutoff)
            .map(|s| (s.window_start, s.session_id, s.stats.counters))
            .collect();
        resolved.sort_by_key(|&(start, session_id, _)| (start, session_id));

        let mut selected = Vec::new();
        for (window_start, session_id, counters) in resolved {
            if !self.is_event(session_id, &counters) {
                continue;
            }

            self.events_detected += 1;
            let event = LossEvent {
                session_id,
                window_start,
            };
            log::debug!(
                "📉 Loss event: session {} window {} (timeout={}, pongloss={})",
                session_id,
                window_start,
                counters.timeout,
                counters.pongloss
            );
            selected.extend(self.select_windows(event, aggregator));
        }

        selected
    }

    fn is_event(&mut self, session_id: SessionId, counters: &Counters) -> bool {
        let state = LinkState::classify(counters);
        let previous = self.link_states.insert(session_id, state);

        if !counters.has_loss() {
            return false;
        }
        if !self.suppress_down {
            return true;
        }
        state == LinkState::Up || previous != Some(state)
    }

    fn select_windows(&mut self, event: LossEvent, aggregator: &DualResolutionAggregator) -> Vec<HighresSnapshot> {
        let hi = event.window_start + self.look_around_ns;
        let mut lo = event.window_start - self.look_around_ns;
        if let Some(&saved) = self.highres_max_saved.get(&event.session_id) {
            lo = lo.max(saved + Resolution::Highres.period_ns());
        }
        if lo > hi {
            return Vec::new();
        }

        let windows: Vec<HighresSnapshot> = aggregator
            .session_snapshots(event.session_id)
            .filter(|s| s.window_start >= lo && s.window_start <= hi)
            .cloned()
            .collect();

        let saved = self.highres_max_saved.entry(event.session_id).or_insert(hi);
        *saved = (*saved).max(hi);

        windows
    }

    pub fn link_states(&self) -> &HashMap<SessionId, LinkState> {
        &self.link_states
    }

    pub fn events_detected(&self) -> u64 {
        self.events_detected
    }

    pub fn last_resolved_cutoff(&self) -> Option<i64> {
        self.last_resolved_cutoff
    }
}
