//! Wire record decoder
//!
//! The prober writes fixed 28-byte records: seven native-endian `i32`
//! fields `session_id, seq, state, created_sec, created_nsec, rtt_sec,
//! rtt_nsec`.

use super::error::DecodeError;
use super::types::{ProbeRecord, ProbeState, NANOS_PER_SEC};

/// Size of one wire record in bytes
pub const RECORD_SIZE: usize = 28;

fn field(bytes: &[u8], index: usize) -> i32 {
    let start = index * 4;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[start..start + 4]);
    i32::from_ne_bytes(raw)
}

fn nanos(field_name: &'static str, sec: i32, nsec: i32) -> Result<i64, DecodeError> {
    if !(0..NANOS_PER_SEC as i32).contains(&nsec) {
        return Err(DecodeError::InvalidNanoseconds {
            field: field_name,
            value: nsec,
        });
    }
    Ok(sec as i64 * NANOS_PER_SEC + nsec as i64)
}

/// Decode one wire record
///
/// `session_id` and `seq` are reinterpreted as unsigned so that sequence
/// wraparound is visible to the sequencer. `rtt` is only populated for
/// states carrying both timestamps.
pub fn decode(bytes: &[u8]) -> Result<ProbeRecord, DecodeError> {
    if bytes.len() != RECORD_SIZE {
        return Err(DecodeError::WrongLength(bytes.len()));
    }

    let state_code = field(bytes, 2);
    let state = ProbeState::from_code(state_code).ok_or(DecodeError::UnknownState(state_code))?;

    let created = nanos("created_nsec", field(bytes, 3), field(bytes, 4))?;
    let rtt = if state.is_successful() {
        Some(nanos("rtt_nsec", field(bytes, 5), field(bytes, 6))?)
    } else {
        None
    };

    Ok(ProbeRecord {
        session_id: field(bytes, 0) as u32,
        seq: field(bytes, 1) as u32,
        state,
        created,
        rtt,
    })
}

/// Encode a record in wire format (used by tests and replay tools)
pub fn encode(record: &ProbeRecord) -> [u8; RECORD_SIZE] {
    let rtt = record.rtt.unwrap_or(0);
    let fields = [
        record.session_id as i32,
        record.seq as i32,
        record.state.code(),
        record.created.div_euclid(NANOS_PER_SEC) as i32,
        record.created.rem_euclid(NANOS_PER_SEC) as i32,
        rtt.div_euclid(NANOS_PER_SEC) as i32,
        rtt.rem_euclid(NANOS_PER_SEC) as i32,
    ];

    let mut out = [0u8; RECORD_SIZE];
    for (i, value) in fields.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
    }
    out
}
