//! Per-session sequencing and neighbor pairing
//!
//! Probes wait in a per-session pending map until they have both received
//! their delay variation from the predecessor (`has_gotten`) and handed
//! their RTT to the successor (`has_given`). Pairing is done through map
//! lookups on `seq - 1` / `seq + 1`; probes never reference each other.

use super::types::{PairedProbe, ProbeRecord, ProbeState, SessionId, Seq};
use std::collections::{HashMap, HashSet, VecDeque};

/// Default sequence gap treated as counter wraparound
pub const DEFAULT_WRAPAROUND_GAP: u32 = 1_000_000;

/// Emitted seqs remembered per session for re-delivery detection
const EMITTED_MEMORY: usize = 4_096;

/// The most recently emitted seqs of a session, oldest evicted first
#[derive(Debug, Default)]
pub struct EmittedSeqs {
    seqs: HashSet<Seq>,
    order: VecDeque<Seq>,
}

impl EmittedSeqs {
    fn insert(&mut self, seq: Seq) {
        if !self.seqs.insert(seq) {
            return;
        }
        self.order.push_back(seq);
        if self.order.len() > EMITTED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.seqs.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.seqs.contains(&seq)
    }
}

/// Sequencing state for one measurement session
#[derive(Debug, Default)]
pub struct SessionSequence {
    pub max_seq_seen: Seq,
    /// Seq of the probe that opened the session (seeded with `has_gotten`)
    pub seeded_seq: Seq,
    pub pending: HashMap<Seq, PairedProbe>,
    pub emitted: EmittedSeqs,
}

/// Result of handing a record to the sequencer
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Probes whose pairing completed, in completion order (may be empty)
    Accepted(Vec<PairedProbe>),
    /// Duplicate of a probe still pending; counted on that probe
    DuplicateCounted,
    /// Duplicate of a probe already emitted to the aggregator
    LateDuplicate(ProbeRecord),
    /// Duplicate for a session we know nothing about
    Discarded,
}

pub struct Sequencer {
    sessions: HashMap<SessionId, SessionSequence>,
    wraparound_gap: u32,
}

/// |rtt(next) - rtt(prev)| when both probes succeeded
fn delay_variation(prev: &ProbeRecord, next: &ProbeRecord) -> Option<i64> {
    if !prev.state.is_successful() || !next.state.is_successful() {
        return None;
    }
    match (prev.rtt, next.rtt) {
        (Some(a), Some(b)) => Some((b - a).abs()),
        _ => None,
    }
}

impl Sequencer {
    pub fn new(wraparound_gap: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            wraparound_gap,
        }
    }

    /// Sequence and pair one record
    pub fn add(&mut self, record: ProbeRecord) -> Admission {
        if record.state == ProbeState::Duplicate {
            return self.add_duplicate(record);
        }

        let mut probe = PairedProbe::new(record);
        let seq = record.seq;

        let session = match self.sessions.get_mut(&record.session_id) {
            Some(session) => session,
            None => {
                // First probe of the session: no predecessor is expected
                probe.has_gotten = true;
                let mut session = SessionSequence {
                    max_seq_seen: seq,
                    seeded_seq: seq,
                    ..Default::default()
                };
                session.pending.insert(seq, probe);
                self.sessions.insert(record.session_id, session);
                return Admission::Accepted(Vec::new());
            }
        };

        // Re-delivery of a pending seq is counted, never stored twice
        if let Some(existing) = session.pending.get_mut(&seq) {
            existing.duplicate_count += 1;
            return Admission::DuplicateCounted;
        }
        // Re-delivery of a seq that already went to the aggregator
        if session.emitted.contains(seq) {
            return Admission::LateDuplicate(record);
        }

        if record.state == ProbeState::Ok {
            if seq > session.max_seq_seen {
                probe.in_order = true;
                session.max_seq_seen = seq;
            } else if session.max_seq_seen - seq > self.wraparound_gap {
                // counter flipped over
                probe.in_order = true;
                session.max_seq_seen = seq;
            } else {
                probe.in_order = false;
            }
        } else {
            probe.in_order = true;
        }

        let prev_seq = seq.wrapping_sub(1);
        let next_seq = seq.wrapping_add(1);

        if let Some(prev) = session.pending.get_mut(&prev_seq) {
            probe.delay_variation = delay_variation(&prev.record, &probe.record);
            prev.has_given = true;
            probe.has_gotten = true;
        }

        if let Some(next) = session.pending.get_mut(&next_seq) {
            next.delay_variation = delay_variation(&probe.record, &next.record);
            next.has_gotten = true;
            probe.has_given = true;
        } else if next_seq == session.seeded_seq {
            // The seeded probe may already have been emitted without us;
            // there is nobody left to give to.
            probe.has_given = true;
        }

        session.pending.insert(seq, probe);

        let mut emitted = Vec::new();
        for candidate in [prev_seq, seq, next_seq] {
            let complete = session
                .pending
                .get(&candidate)
                .map(PairedProbe::is_complete)
                .unwrap_or(false);
            if complete {
                if let Some(done) = session.pending.remove(&candidate) {
                    session.emitted.insert(candidate);
                    emitted.push(done);
                }
            }
        }

        Admission::Accepted(emitted)
    }

    fn add_duplicate(&mut self, record: ProbeRecord) -> Admission {
        let Some(session) = self.sessions.get_mut(&record.session_id) else {
            return Admission::Discarded;
        };

        match session.pending.get_mut(&record.seq) {
            Some(pending) => {
                pending.duplicate_count += 1;
                Admission::DuplicateCounted
            }
            None => Admission::LateDuplicate(record),
        }
    }

    /// Discard all in-flight sequencing state
    ///
    /// Used after a known prober restart, where sequence numbers restart and
    /// pending probes will never find their neighbors.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending_probes();
        self.sessions.clear();
        dropped
    }

    pub fn session_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn session(&self, session_id: SessionId) -> Option<&SessionSequence> {
        self.sessions.get(&session_id)
    }

    pub fn pending_probes(&self) -> usize {
        self.sessions.values().map(|s| s.pending.len()).sum()
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_WRAPAROUND_GAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn make_probe(seq: Seq, state: ProbeState, rtt: Option<i64>) -> ProbeRecord {
        ProbeRecord {
            session_id: 1,
            seq,
            state,
            created: seq as i64 * 1_000_000,
            rtt,
        }
    }

    fn ok(seq: Seq, rtt: i64) -> ProbeRecord {
        make_probe(seq, ProbeState::Ok, Some(rtt))
    }

    fn accepted(admission: Admission) -> Vec<PairedProbe> {
        match admission {
            Admission::Accepted(probes) => probes,
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn test_jitter_between_neighbors() {
        // Test: seq 5,6,7 with rtts 100,150,120 -> delay variation 50 and 30
        let mut sequencer = Sequencer::default();

        assert!(accepted(sequencer.add(ok(5, 100))).is_empty());
        let first = accepted(sequencer.add(ok(6, 150)));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].record.seq, 5);
        assert_eq!(first[0].delay_variation, None);

        let second = accepted(sequencer.add(ok(7, 120)));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].record.seq, 6);
        assert_eq!(second[0].delay_variation, Some(50));

        let third = accepted(sequencer.add(ok(8, 120)));
        assert_eq!(third[0].record.seq, 7);
        assert_eq!(third[0].delay_variation, Some(30));
    }

    #[test]
    fn test_reordered_pairing_computes_same_jitter() {
        let mut sequencer = Sequencer::default();

        sequencer.add(ok(5, 100));
        sequencer.add(ok(7, 120));
        let emitted = accepted(sequencer.add(ok(6, 150)));

        let seq6 = emitted.iter().find(|p| p.record.seq == 6).unwrap();
        assert_eq!(seq6.delay_variation, Some(50));
        assert!(!seq6.in_order);

        let session = sequencer.session(1).unwrap();
        assert_eq!(session.pending[&7].delay_variation, Some(30));
        assert_eq!(session.max_seq_seen, 7);
    }

    #[test]
    fn test_no_jitter_across_unsuccessful_probe() {
        let mut sequencer = Sequencer::default();

        sequencer.add(ok(1, 100));
        sequencer.add(make_probe(2, ProbeState::Timeout, None));
        let emitted = accepted(sequencer.add(ok(3, 200)));

        let lost = emitted.iter().find(|p| p.record.seq == 2).unwrap();
        assert_eq!(lost.delay_variation, None);
        assert!(lost.in_order);
        assert_eq!(sequencer.session(1).unwrap().pending[&3].delay_variation, None);
    }

    #[test]
    fn test_dscp_error_counts_as_successful_for_jitter() {
        let mut sequencer = Sequencer::default();

        sequencer.add(ok(1, 100));
        sequencer.add(make_probe(2, ProbeState::DscpError, Some(130)));
        let emitted = accepted(sequencer.add(ok(3, 90)));

        assert_eq!(emitted[0].record.seq, 2);
        assert_eq!(emitted[0].delay_variation, Some(30));
    }

    #[test]
    fn test_wraparound_treated_as_in_order() {
        let mut sequencer = Sequencer::default();

        sequencer.add(ok(4_000_000_100, 100));
        let _ = sequencer.add(ok(50, 100));

        let session = sequencer.session(1).unwrap();
        assert_eq!(session.max_seq_seen, 50);
        assert!(session.pending[&50].in_order);
    }

    #[test]
    fn test_configurable_wraparound_gap() {
        let mut sequencer = Sequencer::new(10);

        sequencer.add(ok(100, 1));
        sequencer.add(ok(80, 1));

        let session = sequencer.session(1).unwrap();
        assert!(session.pending[&80].in_order);
        assert_eq!(session.max_seq_seen, 80);
    }

    #[test]
    fn test_duplicates() {
        let mut sequencer = Sequencer::default();
        let dup = |seq| make_probe(seq, ProbeState::Duplicate, None);

        // Unknown session: discarded
        assert_eq!(sequencer.add(dup(1)), Admission::Discarded);

        sequencer.add(ok(1, 100));
        assert_eq!(sequencer.add(dup(1)), Admission::DuplicateCounted);
        // A second non-duplicate delivery of a pending seq counts too
        assert_eq!(sequencer.add(ok(1, 100)), Admission::DuplicateCounted);

        let emitted = accepted(sequencer.add(ok(2, 100)));
        assert_eq!(emitted[0].duplicate_count, 2);

        assert!(matches!(sequencer.add(dup(1)), Admission::LateDuplicate(r) if r.seq == 1));
    }

    #[test]
    fn test_redelivered_emitted_seq_is_late_duplicate() {
        // Test: a second Ok for an emitted seq must not wait forever as pending
        let mut sequencer = Sequencer::default();
        sequencer.add(ok(1, 100));
        sequencer.add(ok(2, 100));
        sequencer.add(ok(3, 100));

        let again = make_probe(2, ProbeState::Ok, Some(100));
        assert_eq!(sequencer.add(again), Admission::LateDuplicate(again));

        let pending: Vec<Seq> = sequencer.session(1).unwrap().pending.keys().copied().collect();
        assert_eq!(pending, vec![3]);

        // A reordered seq that was never seen is still sequenced normally
        sequencer.add(ok(10, 100));
        assert!(accepted(sequencer.add(ok(6, 100))).is_empty());
        assert_eq!(sequencer.pending_probes(), 3);
    }

    #[test]
    fn test_shuffled_delivery_leaves_only_edges_pending() {
        // Test: arbitrary delivery order never leaks interior probes
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut seqs: Vec<Seq> = (1..=200).collect();
            seqs.shuffle(&mut rng);

            let mut sequencer = Sequencer::default();
            let mut emitted = Vec::new();
            for &seq in &seqs {
                emitted.extend(accepted(sequencer.add(ok(seq, seq as i64 * 10))));
            }

            let session = sequencer.session(1).unwrap();
            let mut pending: Vec<Seq> = session.pending.keys().copied().collect();
            pending.sort();

            // seq 200 never hands its RTT on; seq 1 never receives a
            // predecessor unless it happened to arrive first
            let mut expected = vec![200];
            if seqs[0] != 1 {
                expected.insert(0, 1);
            }
            assert_eq!(pending, expected, "seed {}", seed);
            assert_eq!(emitted.len() + pending.len(), seqs.len());

            let mut seen: Vec<Seq> = emitted.iter().map(|p| p.record.seq).collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), emitted.len());

            for probe in emitted.iter().filter(|p| p.record.seq > 1 && p.record.seq != seqs[0]) {
                assert_eq!(probe.delay_variation, Some(10));
            }
        }
    }

    #[test]
    fn test_clear_discards_pending_state() {
        let mut sequencer = Sequencer::default();
        sequencer.add(ok(1, 1));
        sequencer.add(ok(3, 1));

        assert_eq!(sequencer.clear(), 2);
        assert!(sequencer.session(1).is_none());
        assert_eq!(sequencer.pending_probes(), 0);
    }
}
