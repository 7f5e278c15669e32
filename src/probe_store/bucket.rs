//! Aggregate buckets and order statistics
//!
//! A bucket accumulates counters and raw samples for one session and one
//! window. Statistics are always recomputed from the raw samples; percentiles
//! are never derived from other percentiles.

use super::types::{AggregateStats, Counters, PairedProbe, ProbeState, SampleStats};

/// Running counters and raw samples for one (session, window)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateBucket {
    pub counters: Counters,
    pub rtts: Vec<i64>,
    /// Absolute delay variations
    pub delay_variations: Vec<i64>,
}

impl AggregateBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.total == 0 && self.counters.duplicates == 0
    }

    /// Account one fully paired probe
    pub fn add(&mut self, probe: &PairedProbe) {
        let record = &probe.record;

        match record.state {
            ProbeState::Ok => self.counters.success += 1,
            ProbeState::DscpError => self.counters.dscp_error += 1,
            ProbeState::TimestampError => self.counters.timestamp_error += 1,
            ProbeState::PongLoss => self.counters.pongloss += 1,
            ProbeState::Timeout => self.counters.timeout += 1,
            // duplicates never reach the aggregator on their own
            ProbeState::Duplicate => {}
        }

        self.counters.total += 1;
        self.counters.duplicates += probe.duplicate_count as u64;
        if !probe.in_order {
            self.counters.reordered += 1;
        }

        if record.state.is_successful() {
            match record.rtt {
                Some(rtt) if rtt >= 0 => self.rtts.push(rtt),
                Some(rtt) => {
                    log::warn!(
                        "⚠️  Ignoring negative RTT {} for successful probe (session {}, seq {})",
                        rtt,
                        record.session_id,
                        record.seq
                    );
                }
                None => {}
            }

            if let Some(dv) = probe.delay_variation {
                self.delay_variations.push(dv.abs());
            }
        }
    }

    /// Fold another bucket's counters and raw samples into this one
    pub fn merge(&mut self, other: &AggregateBucket) {
        self.counters.merge(&other.counters);
        self.rtts.extend_from_slice(&other.rtts);
        self.delay_variations.extend_from_slice(&other.delay_variations);
    }

    /// Sort the raw samples and derive statistics
    pub fn compute_stats(&mut self) -> AggregateStats {
        self.rtts.sort_unstable();
        self.delay_variations.sort_unstable();

        AggregateStats {
            counters: self.counters,
            rtt: sample_stats(&self.rtts),
            delay_variation: sample_stats(&self.delay_variations),
        }
    }
}

/// Element at rank `p` (0..=100) of an ascending-sorted slice
///
/// Index is `floor(len * p / 100)`; `p = 0` is the minimum and `p >= 100`
/// the maximum. Returns `None` for an empty slice.
pub fn percentile(sorted: &[i64], p: u32) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    if p >= 100 {
        return sorted.last().copied();
    }
    let index = (sorted.len() * p as usize) / 100;
    sorted.get(index.min(sorted.len() - 1)).copied()
}

/// min / median / mean / max / 95th over an ascending-sorted slice
pub fn sample_stats(sorted: &[i64]) -> Option<SampleStats> {
    let (&min, &max) = (sorted.first()?, sorted.last()?);
    let sum: i128 = sorted.iter().map(|&v| v as i128).sum();

    Some(SampleStats {
        min,
        median: percentile(sorted, 50)?,
        avg: sum as f64 / sorted.len() as f64,
        max,
        p95: percentile(sorted, 95)?,
    })
}
