//! Core data types shared by the probe store components
//!
//! All timestamps and durations are integer nanoseconds since the UNIX epoch.

use serde::{Deserialize, Serialize};

/// Nanoseconds per second
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Measurement session identifier
pub type SessionId = u32;

/// Probe sequence number (monotonic per session, wraps)
pub type Seq = u32;

/// Outcome of a single probe as reported by the prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeState {
    /// Got both PONG and valid timestamps
    Ok,
    /// Got PONG, but with an unexpected traffic class
    DscpError,
    /// Got PONG, but remote timestamps are missing
    TimestampError,
    /// Timed out; got the timestamp reply but lost the PONG
    PongLoss,
    /// Timed out; got neither PONG nor timestamps
    Timeout,
    /// Unrecognised PONG, most likely a duplicate
    Duplicate,
}

impl ProbeState {
    /// Map a wire state code to a probe state
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ProbeState::Ok),
            2 => Some(ProbeState::DscpError),
            3 => Some(ProbeState::TimestampError),
            4 => Some(ProbeState::PongLoss),
            5 => Some(ProbeState::Timeout),
            6 => Some(ProbeState::Duplicate),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ProbeState::Ok => 1,
            ProbeState::DscpError => 2,
            ProbeState::TimestampError => 3,
            ProbeState::PongLoss => 4,
            ProbeState::Timeout => 5,
            ProbeState::Duplicate => 6,
        }
    }

    /// Both directions were timestamped, so the probe carries an RTT
    pub fn is_successful(&self) -> bool {
        matches!(self, ProbeState::Ok | ProbeState::DscpError)
    }
}

/// Decoded probe result, immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRecord {
    pub session_id: SessionId,
    pub seq: Seq,
    pub state: ProbeState,
    /// Creation time of the probe
    pub created: i64,
    /// Round-trip time, present only for successful probes
    pub rtt: Option<i64>,
}

/// A probe travelling through the sequencer
///
/// Pairing fills in `delay_variation` and flips `has_given` / `has_gotten`.
/// Once both flags are set the probe is handed to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedProbe {
    pub record: ProbeRecord,
    /// |rtt - rtt(predecessor)|, only when both probes succeeded
    pub delay_variation: Option<i64>,
    pub in_order: bool,
    pub duplicate_count: u32,
    /// Contributed its RTT to the successor's delay variation
    pub has_given: bool,
    /// Received its own delay variation from the predecessor
    pub has_gotten: bool,
}

impl PairedProbe {
    pub fn new(record: ProbeRecord) -> Self {
        Self {
            record,
            delay_variation: None,
            in_order: true,
            duplicate_count: 0,
            has_given: false,
            has_gotten: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.has_given && self.has_gotten
    }
}

/// Aggregation resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// 1-second windows, kept only around loss events
    Highres,
    /// 300-second windows, the durable baseline
    Lowres,
}

impl Resolution {
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::Highres => 1,
            Resolution::Lowres => 300,
        }
    }

    pub fn period_ns(&self) -> i64 {
        self.seconds() * NANOS_PER_SEC
    }

    pub fn from_seconds(seconds: i64) -> Option<Self> {
        match seconds {
            1 => Some(Resolution::Highres),
            300 => Some(Resolution::Lowres),
            _ => None,
        }
    }

    /// Start of the window containing `ts`
    pub fn window_start(&self, ts: i64) -> i64 {
        ts.div_euclid(self.period_ns()) * self.period_ns()
    }
}

/// Per-window probe counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total: u64,
    pub success: u64,
    pub timestamp_error: u64,
    pub dscp_error: u64,
    pub pongloss: u64,
    pub timeout: u64,
    pub duplicates: u64,
    pub reordered: u64,
}

impl Counters {
    pub fn merge(&mut self, other: &Counters) {
        self.total += other.total;
        self.success += other.success;
        self.timestamp_error += other.timestamp_error;
        self.dscp_error += other.dscp_error;
        self.pongloss += other.pongloss;
        self.timeout += other.timeout;
        self.duplicates += other.duplicates;
        self.reordered += other.reordered;
    }

    pub fn has_loss(&self) -> bool {
        self.timeout > 0 || self.pongloss > 0
    }
}

/// Order statistics over a sorted sample list
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub min: i64,
    pub median: i64,
    pub avg: f64,
    pub max: i64,
    pub p95: i64,
}

/// Counters plus derived statistics for one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub counters: Counters,
    pub rtt: Option<SampleStats>,
    pub delay_variation: Option<SampleStats>,
}

/// Durable aggregate row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAggregate {
    pub session_id: SessionId,
    pub resolution: Resolution,
    pub window_start: i64,
    pub stats: AggregateStats,
}

/// Statistics for one sub-interval of a `get_aggregate` request
///
/// Missing data is reported as zeroes, never as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalAggregate {
    /// Sub-interval start, seconds since epoch
    pub start: i64,
    pub counters: Counters,
    pub rtt: SampleStats,
    pub delay_variation: SampleStats,
}
