//! Probe ingestion from the prober's byte stream
//!
//! Reads fixed-size wire records one at a time and hands every decoded
//! record to the store. The stream itself provides backpressure; nothing is
//! buffered beyond the current record.

use super::decoder::{self, RECORD_SIZE};
use super::engine::ProbeStore;
use super::error::ProbeStoreError;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};

const THROUGHPUT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Counters for one ingestion run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub records: u64,
    pub decode_errors: u64,
    /// Bytes of a trailing partial record dropped at end of stream
    pub truncated_bytes: usize,
}

/// Read records from `reader` until end of stream
///
/// Undecodable records are logged and dropped. A partial record at the end
/// of the stream is discarded.
///
/// Arguments:
/// - `reader`: byte stream written by the prober (FIFO, socket, file)
/// - `store`: probe store receiving decoded records
pub async fn run_ingestion<R>(reader: R, store: &ProbeStore) -> Result<IngestionStats, ProbeStoreError>
where
    R: AsyncRead + Unpin,
{
    run_ingestion_until(reader, store, &AtomicBool::new(false)).await
}

/// Like `run_ingestion`, but returns before the next record once `stop` is
/// set
pub async fn run_ingestion_until<R>(
    mut reader: R,
    store: &ProbeStore,
    stop: &AtomicBool,
) -> Result<IngestionStats, ProbeStoreError>
where
    R: AsyncRead + Unpin,
{
    let mut stats = IngestionStats::default();
    let mut buf = [0u8; RECORD_SIZE];
    let mut window_records = 0u64;
    let mut last_log_time = Instant::now();

    loop {
        if stop.load(Ordering::Relaxed) {
            log::info!("🛑 Ingestion stopped after {} records", stats.records);
            return Ok(stats);
        }

        let filled = read_record(&mut reader, &mut buf).await?;
        if filled < RECORD_SIZE {
            stats.truncated_bytes = filled;
            if filled > 0 {
                log::warn!("⚠️  Dropping truncated record ({} of {} bytes)", filled, RECORD_SIZE);
            }
            break;
        }

        match decoder::decode(&buf) {
            Ok(record) => {
                store.add(record);
                stats.records += 1;
                window_records += 1;
            }
            Err(e) => {
                stats.decode_errors += 1;
                log::error!("❌ Dropping undecodable probe record: {}", e);
            }
        }

        // Log throughput every 10 seconds
        if last_log_time.elapsed() >= THROUGHPUT_LOG_INTERVAL {
            let per_sec = window_records as f64 / last_log_time.elapsed().as_secs_f64();
            log::info!(
                "📊 Ingestion rate: {:.1} probes/sec (total: {})",
                per_sec,
                stats.records
            );
            last_log_time = Instant::now();
            window_records = 0;
        }
    }

    if stats.records > 0 || stats.decode_errors > 0 {
        log::info!(
            "📭 Probe stream ended ({} records, {} decode errors)",
            stats.records,
            stats.decode_errors
        );
    }
    Ok(stats)
}

/// Fill `buf` completely, returning fewer bytes only at end of stream
async fn read_record<R>(reader: &mut R, buf: &mut [u8; RECORD_SIZE]) -> Result<usize, ProbeStoreError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < RECORD_SIZE {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe_store::config::ProbeStoreConfig;
    use crate::probe_store::decoder::encode;
    use crate::probe_store::types::{ProbeRecord, ProbeState, NANOS_PER_SEC};
    use tempfile::tempdir;

    fn make_record(seq: u32) -> ProbeRecord {
        ProbeRecord {
            session_id: 5,
            seq,
            state: ProbeState::Ok,
            created: 1_700_000_000 * NANOS_PER_SEC + seq as i64,
            rtt: Some(2_000),
        }
    }

    #[tokio::test]
    async fn test_ingests_stream_and_skips_bad_records() {
        let dir = tempdir().unwrap();
        let mut config = ProbeStoreConfig::default();
        config.db_path = dir.path().join("probes.db");
        let store = ProbeStore::open(config).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode(&make_record(1)));
        let mut bad = encode(&make_record(2));
        bad[8..12].copy_from_slice(&42i32.to_ne_bytes());
        bytes.extend_from_slice(&bad);
        bytes.extend_from_slice(&encode(&make_record(3)));
        bytes.extend_from_slice(&[0u8; 5]);

        let stats = run_ingestion(bytes.as_slice(), &store).await.unwrap();

        assert_eq!(stats.records, 2);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.truncated_bytes, 5);

        // seq 1 and 3 are not neighbors; both still pending
        let storage = store.get_storage_statistics().await.unwrap();
        assert_eq!(storage.pending_probes, 2);

        store.close().unwrap();
    }

    #[tokio::test]
    async fn test_stop_flag_ends_ingestion_between_records() {
        let dir = tempdir().unwrap();
        let mut config = ProbeStoreConfig::default();
        config.db_path = dir.path().join("probes.db");
        let store = ProbeStore::open(config).unwrap();

        // The writer half stays open, so the stream never ends on its own
        let (mut prober, reader) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut prober, &encode(&make_record(1)))
            .await
            .unwrap();

        let stop = AtomicBool::new(true);
        let stats = run_ingestion_until(reader, &store, &stop).await.unwrap();
        assert_eq!(stats.records, 0);

        drop(prober);
        store.close().unwrap();
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let dir = tempdir().unwrap();
        let mut config = ProbeStoreConfig::default();
        config.db_path = dir.path().join("probes.db");
        let store = ProbeStore::open(config).unwrap();

        let stats = run_ingestion(tokio::io::empty(), &store).await.unwrap();
        assert_eq!(stats, IngestionStats::default());

        store.close().unwrap();
    }
}
