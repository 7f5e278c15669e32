//! Single-writer SQLite persistence
//!
//! One OS thread owns the only writable connection. Everything else talks to
//! it through an unbounded request queue, so producers never block on disk.
//! Mutations are batched into a transaction that is opened lazily and
//! committed on request or once `commit_threshold` statements are pending.

use super::error::ProbeStoreError;
use super::types::{AggregateStats, Counters, PersistedAggregate, Resolution, SampleStats};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS aggregates (
    session_id INTEGER NOT NULL,
    resolution_seconds INTEGER NOT NULL,
    window_start_ns INTEGER NOT NULL,
    total INTEGER NOT NULL,
    success INTEGER NOT NULL,
    timestamp_error INTEGER NOT NULL,
    dscp_error INTEGER NOT NULL,
    pongloss INTEGER NOT NULL,
    timeout INTEGER NOT NULL,
    duplicates INTEGER NOT NULL,
    reordered INTEGER NOT NULL,
    rtt_min INTEGER,
    rtt_med INTEGER,
    rtt_avg REAL,
    rtt_max INTEGER,
    rtt_95th INTEGER,
    delayvar_min INTEGER,
    delayvar_med INTEGER,
    delayvar_avg REAL,
    delayvar_max INTEGER,
    delayvar_95th INTEGER
);
CREATE INDEX IF NOT EXISTS idx_aggregates_session_window
    ON aggregates(session_id, window_start_ns);
CREATE INDEX IF NOT EXISTS idx_aggregates_session_window_resolution
    ON aggregates(session_id, window_start_ns, resolution_seconds);
";

pub const INSERT_AGGREGATE_SQL: &str = "INSERT INTO aggregates (
    session_id, resolution_seconds, window_start_ns,
    total, success, timestamp_error, dscp_error, pongloss, timeout, duplicates, reordered,
    rtt_min, rtt_med, rtt_avg, rtt_max, rtt_95th,
    delayvar_min, delayvar_med, delayvar_avg, delayvar_max, delayvar_95th
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)";

/// Column list matching `row_to_aggregate`
pub const AGGREGATE_COLUMNS: &str = "session_id, resolution_seconds, window_start_ns,
    total, success, timestamp_error, dscp_error, pongloss, timeout, duplicates, reordered,
    rtt_min, rtt_med, rtt_avg, rtt_max, rtt_95th,
    delayvar_min, delayvar_med, delayvar_avg, delayvar_max, delayvar_95th";

/// Bump the duplicate counter of any persisted row covering a probe
///
/// Params: session_id, highres window start, lowres window start
pub const LATE_DUPLICATE_SQL: &str = "UPDATE aggregates SET duplicates = duplicates + 1
    WHERE session_id = ?1
      AND ((resolution_seconds = 1 AND window_start_ns = ?2)
        OR (resolution_seconds = 300 AND window_start_ns = ?3))";

/// Params: resolution_seconds, oldest window start to keep
pub const DELETE_EXPIRED_SQL: &str =
    "DELETE FROM aggregates WHERE resolution_seconds = ?1 AND window_start_ns < ?2";

/// Streamed result of a `Select` request
#[derive(Debug, Clone, PartialEq)]
pub enum SelectMessage {
    Row(Vec<Value>),
    Done,
}

enum WriterRequest {
    Execute {
        sql: String,
        params: Vec<Value>,
    },
    Select {
        sql: String,
        params: Vec<Value>,
        respond: mpsc::UnboundedSender<SelectMessage>,
    },
    Commit,
    Close,
}

/// Counters reported by the writer thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub executed: u64,
    pub failed: u64,
    pub commits: u64,
    pub threshold_commits: u64,
    pub selects: u64,
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub db_path: PathBuf,
    pub commit_threshold: usize,
    pub connect_retry: Duration,
}

/// Handle to the persistence worker thread
pub struct PersistenceWriter {
    requests: mpsc::UnboundedSender<WriterRequest>,
    worker: Mutex<Option<JoinHandle<WriterStats>>>,
    connection_lost: Arc<AtomicBool>,
}

impl PersistenceWriter {
    /// Spawn the worker thread
    ///
    /// Returns as soon as the thread runs; the connection is established
    /// (with retries) on the worker and queued requests wait for it.
    pub fn start(options: WriterOptions) -> Result<Self, ProbeStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_lost = Arc::new(AtomicBool::new(false));

        let lost = connection_lost.clone();
        let worker = std::thread::Builder::new()
            .name("probe-store-writer".to_string())
            .spawn(move || run_worker(rx, options, lost))?;

        Ok(Self {
            requests: tx,
            worker: Mutex::new(Some(worker)),
            connection_lost,
        })
    }

    fn send(&self, request: WriterRequest) -> bool {
        if self.requests.send(request).is_err() {
            log::warn!("⚠️  Persistence writer is closed, dropping request");
            return false;
        }
        true
    }

    /// Queue a mutation
    pub fn execute(&self, sql: impl Into<String>, params: Vec<Value>) {
        self.send(WriterRequest::Execute {
            sql: sql.into(),
            params,
        });
    }

    pub fn commit(&self) {
        self.send(WriterRequest::Commit);
    }

    /// Run a query on the writer connection and collect all rows
    pub async fn select(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<Vec<Vec<Value>>, ProbeStoreError> {
        let (respond, mut rows_rx) = mpsc::unbounded_channel();
        let request = WriterRequest::Select {
            sql: sql.into(),
            params,
            respond,
        };
        if !self.send(request) {
            return Err(ProbeStoreError::Persistence("writer closed".to_string()));
        }

        let mut rows = Vec::new();
        while let Some(message) = rows_rx.recv().await {
            match message {
                SelectMessage::Row(row) => rows.push(row),
                SelectMessage::Done => return Ok(rows),
            }
        }
        Err(ProbeStoreError::Persistence(
            "writer stopped before finishing select".to_string(),
        ))
    }

    /// Drain the queue, commit, close the connection and join the worker
    ///
    /// Blocks the calling thread. Calling it twice returns default stats.
    pub fn close(&self) -> Result<WriterStats, ProbeStoreError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(WriterStats::default());
        };

        // The worker may already be gone if it never connected
        let _ = self.requests.send(WriterRequest::Close);

        handle
            .join()
            .map_err(|_| ProbeStoreError::Persistence("writer thread panicked".to_string()))
    }

    pub fn is_healthy(&self) -> bool {
        !self.connection_lost.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn mark_connection_lost(&self) {
        self.connection_lost.store(true, Ordering::Relaxed);
    }
}

/// Open the database, apply pragmas and create the schema
pub fn open_database(db_path: &Path) -> Result<Connection, ProbeStoreError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(conn)
}

fn is_connection_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
            )
    )
}

struct Worker {
    conn: Connection,
    commit_threshold: usize,
    in_transaction: bool,
    outstanding: usize,
    stats: WriterStats,
    connection_lost: Arc<AtomicBool>,
}

impl Worker {
    fn check(&self, err: &rusqlite::Error) {
        if is_connection_error(err) && !self.connection_lost.swap(true, Ordering::Relaxed) {
            log::error!("❌ Database connection lost: {}", err);
        }
    }

    fn execute(&mut self, sql: &str, params: &[Value]) {
        if !self.in_transaction {
            match self.conn.execute_batch("BEGIN") {
                Ok(()) => self.in_transaction = true,
                Err(e) => {
                    self.check(&e);
                    log::error!("❌ Failed to begin transaction: {}", e);
                }
            }
        }

        match self.conn.execute(sql, params_from_iter(params.iter())) {
            Ok(_) => {
                self.stats.executed += 1;
                // autocommitted statements have nothing left to commit
                if self.in_transaction {
                    self.outstanding += 1;
                }
            }
            Err(e) => {
                self.stats.failed += 1;
                self.check(&e);
                log::error!("❌ Dropping failed statement: {} ({})", e, sql);
            }
        }

        if self.outstanding >= self.commit_threshold {
            log::debug!("💾 Commit threshold reached ({} statements)", self.outstanding);
            self.commit();
            self.stats.threshold_commits += 1;
        }
    }

    fn commit(&mut self) {
        if !self.in_transaction {
            return;
        }
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => self.stats.commits += 1,
            Err(e) => {
                self.check(&e);
                log::error!("❌ Commit failed: {}", e);
                let _ = self.conn.execute_batch("ROLLBACK");
            }
        }
        self.in_transaction = false;
        self.outstanding = 0;
    }

    fn select(&mut self, sql: &str, params: &[Value], respond: &mpsc::UnboundedSender<SelectMessage>) {
        self.stats.selects += 1;
        if let Err(e) = self.stream_rows(sql, params, respond) {
            self.check(&e);
            log::error!("❌ Select failed: {} ({})", e, sql);
        }
        let _ = respond.send(SelectMessage::Done);
    }

    fn stream_rows(
        &self,
        sql: &str,
        params: &[Value],
        respond: &mpsc::UnboundedSender<SelectMessage>,
    ) -> Result<(), rusqlite::Error> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let values = (0..columns)
                .map(|i| row.get::<_, Value>(i))
                .collect::<Result<Vec<_>, _>>()?;
            if respond.send(SelectMessage::Row(values)).is_err() {
                // requester gave up
                break;
            }
        }
        Ok(())
    }

    /// Returns false once `Close` was handled
    fn handle(&mut self, request: WriterRequest) -> bool {
        match request {
            WriterRequest::Execute { sql, params } => self.execute(&sql, &params),
            WriterRequest::Select { sql, params, respond } => self.select(&sql, &params, &respond),
            WriterRequest::Commit => self.commit(),
            WriterRequest::Close => return false,
        }
        true
    }
}

/// Connect, retrying with a fixed backoff. Requests arriving meanwhile are
/// buffered; a `Close` aborts the attempt.
fn connect_with_retry(
    rx: &mut mpsc::UnboundedReceiver<WriterRequest>,
    options: &WriterOptions,
    buffered: &mut VecDeque<WriterRequest>,
) -> Option<Connection> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match open_database(&options.db_path) {
            Ok(conn) => {
                log::info!(
                    "✅ Database ready at {} (attempt {})",
                    options.db_path.display(),
                    attempt
                );
                return Some(conn);
            }
            Err(e) => {
                log::warn!(
                    "⏳ Database connect attempt {} failed: {}; retrying in {:?}",
                    attempt,
                    e,
                    options.connect_retry
                );
            }
        }

        while let Ok(request) = rx.try_recv() {
            let closing = matches!(request, WriterRequest::Close);
            buffered.push_back(request);
            if closing {
                return None;
            }
        }
        std::thread::sleep(options.connect_retry);
    }
}

fn run_worker(
    mut rx: mpsc::UnboundedReceiver<WriterRequest>,
    options: WriterOptions,
    connection_lost: Arc<AtomicBool>,
) -> WriterStats {
    let mut buffered = VecDeque::new();

    let Some(conn) = connect_with_retry(&mut rx, &options, &mut buffered) else {
        let mut stats = WriterStats::default();
        for request in buffered {
            match request {
                WriterRequest::Execute { .. } => stats.failed += 1,
                WriterRequest::Select { respond, .. } => {
                    let _ = respond.send(SelectMessage::Done);
                }
                _ => {}
            }
        }
        log::error!("❌ Writer closed before the database became available");
        return stats;
    };

    let mut worker = Worker {
        conn,
        commit_threshold: options.commit_threshold.max(1),
        in_transaction: false,
        outstanding: 0,
        stats: WriterStats::default(),
        connection_lost,
    };

    let mut running = true;
    while running {
        let request = match buffered.pop_front() {
            Some(request) => request,
            None => match rx.blocking_recv() {
                Some(request) => request,
                None => break,
            },
        };
        running = worker.handle(request);
    }

    // Anything queued behind Close still gets written
    rx.close();
    while let Ok(request) = rx.try_recv() {
        worker.handle(request);
    }

    worker.commit();
    log::info!(
        "✅ Persistence writer closed: {} executed, {} failed, {} commits",
        worker.stats.executed,
        worker.stats.failed,
        worker.stats.commits
    );
    worker.stats
}

fn stats_params(stats: Option<SampleStats>) -> [Value; 5] {
    match stats {
        Some(s) => [
            Value::Integer(s.min),
            Value::Integer(s.median),
            Value::Real(s.avg),
            Value::Integer(s.max),
            Value::Integer(s.p95),
        ],
        None => [Value::Null, Value::Null, Value::Null, Value::Null, Value::Null],
    }
}

/// Parameters for `INSERT_AGGREGATE_SQL`
pub fn insert_params(row: &PersistedAggregate) -> Vec<Value> {
    let c = &row.stats.counters;
    let mut params = vec![
        Value::Integer(row.session_id as i64),
        Value::Integer(row.resolution.seconds()),
        Value::Integer(row.window_start),
        Value::Integer(c.total as i64),
        Value::Integer(c.success as i64),
        Value::Integer(c.timestamp_error as i64),
        Value::Integer(c.dscp_error as i64),
        Value::Integer(c.pongloss as i64),
        Value::Integer(c.timeout as i64),
        Value::Integer(c.duplicates as i64),
        Value::Integer(c.reordered as i64),
    ];
    params.extend(stats_params(row.stats.rtt));
    params.extend(stats_params(row.stats.delay_variation));
    params
}

fn int_at(row: &[Value], index: usize) -> Option<i64> {
    match row.get(index)? {
        Value::Integer(v) => Some(*v),
        Value::Real(v) => Some(*v as i64),
        _ => None,
    }
}

fn real_at(row: &[Value], index: usize) -> Option<f64> {
    match row.get(index)? {
        Value::Real(v) => Some(*v),
        Value::Integer(v) => Some(*v as f64),
        _ => None,
    }
}

fn stats_at(row: &[Value], offset: usize) -> Option<SampleStats> {
    Some(SampleStats {
        min: int_at(row, offset)?,
        median: int_at(row, offset + 1)?,
        avg: real_at(row, offset + 2)?,
        max: int_at(row, offset + 3)?,
        p95: int_at(row, offset + 4)?,
    })
}

/// Map a row selected with `AGGREGATE_COLUMNS`
pub fn row_to_aggregate(row: &[Value]) -> Option<PersistedAggregate> {
    let count = |i| int_at(row, i).map(|v| v.max(0) as u64);
    let counters = Counters {
        total: count(3)?,
        success: count(4)?,
        timestamp_error: count(5)?,
        dscp_error: count(6)?,
        pongloss: count(7)?,
        timeout: count(8)?,
        duplicates: count(9)?,
        reordered: count(10)?,
    };

    Some(PersistedAggregate {
        session_id: int_at(row, 0)? as u32,
        resolution: Resolution::from_seconds(int_at(row, 1)?)?,
        window_start: int_at(row, 2)?,
        stats: AggregateStats {
            counters,
            rtt: stats_at(row, 11),
            delay_variation: stats_at(row, 16),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe_store::types::NANOS_PER_SEC;
    use tempfile::tempdir;

    /// Integer from a single-column row (e.g. `COUNT(*)`)
    fn scalar(rows: &[Vec<Value>]) -> Option<i64> {
        rows.first().and_then(|row| int_at(row, 0))
    }

    fn options(db_path: PathBuf) -> WriterOptions {
        WriterOptions {
            db_path,
            commit_threshold: 10_000,
            connect_retry: Duration::from_millis(10),
        }
    }

    fn make_row(window: i64) -> PersistedAggregate {
        PersistedAggregate {
            session_id: 4,
            resolution: Resolution::Highres,
            window_start: window * NANOS_PER_SEC,
            stats: AggregateStats {
                counters: Counters {
                    total: 10,
                    success: 9,
                    timeout: 1,
                    ..Default::default()
                },
                rtt: Some(SampleStats {
                    min: 100,
                    median: 120,
                    avg: 121.5,
                    max: 200,
                    p95: 190,
                }),
                delay_variation: None,
            },
        }
    }

    #[tokio::test]
    async fn test_threshold_and_final_commit() {
        // Test: 15 000 executes without Commit -> 1 threshold commit + 1 final
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("probes.db");
        let writer = PersistenceWriter::start(options(db_path.clone())).unwrap();

        for i in 0..15_000 {
            writer.execute(INSERT_AGGREGATE_SQL, insert_params(&make_row(i)));
        }
        let stats = writer.close().unwrap();

        assert_eq!(stats.executed, 15_000);
        assert_eq!(stats.threshold_commits, 1);
        assert_eq!(stats.commits, 2);

        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM aggregates", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 15_000);
    }

    #[tokio::test]
    async fn test_select_round_trips_aggregate() {
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::start(options(dir.path().join("probes.db"))).unwrap();

        let row = make_row(7);
        writer.execute(INSERT_AGGREGATE_SQL, insert_params(&row));
        writer.commit();

        let rows = writer
            .select(
                format!("SELECT {} FROM aggregates WHERE session_id = ?1", AGGREGATE_COLUMNS),
                vec![Value::Integer(4)],
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(row_to_aggregate(&rows[0]), Some(row));
        assert!(writer.is_healthy());

        let stats = writer.close().unwrap();
        assert_eq!(stats.selects, 1);
        assert_eq!(stats.commits, 1);
    }

    #[tokio::test]
    async fn test_failed_statement_is_dropped() {
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::start(options(dir.path().join("probes.db"))).unwrap();

        writer.execute("INSERT INTO missing_table VALUES (1)", vec![]);
        writer.execute(INSERT_AGGREGATE_SQL, insert_params(&make_row(1)));

        let count = writer
            .select("SELECT COUNT(*) FROM aggregates", vec![])
            .await
            .unwrap();
        assert_eq!(scalar(&count), Some(1));
        assert!(writer.is_healthy());

        let stats = writer.close().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.executed, 1);
    }

    #[tokio::test]
    async fn test_late_duplicate_and_expiry_statements() {
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::start(options(dir.path().join("probes.db"))).unwrap();

        writer.execute(INSERT_AGGREGATE_SQL, insert_params(&make_row(10)));
        writer.execute(INSERT_AGGREGATE_SQL, insert_params(&make_row(20)));
        writer.execute(
            LATE_DUPLICATE_SQL,
            vec![
                Value::Integer(4),
                Value::Integer(10 * NANOS_PER_SEC),
                Value::Integer(0),
            ],
        );
        let dups = writer
            .select(
                "SELECT duplicates FROM aggregates WHERE window_start_ns = ?1",
                vec![Value::Integer(10 * NANOS_PER_SEC)],
            )
            .await
            .unwrap();
        assert_eq!(scalar(&dups), Some(1));

        writer.execute(
            DELETE_EXPIRED_SQL,
            vec![Value::Integer(1), Value::Integer(15 * NANOS_PER_SEC)],
        );

        let rows = writer
            .select(format!("SELECT {} FROM aggregates", AGGREGATE_COLUMNS), vec![])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let remaining = row_to_aggregate(&rows[0]).unwrap();
        assert_eq!(remaining.window_start, 20 * NANOS_PER_SEC);
        assert_eq!(remaining.stats.counters.duplicates, 0);

        writer.close().unwrap();
    }

    #[test]
    fn test_close_while_connecting() {
        // Test: a directory is not a database; Close must still return
        let dir = tempdir().unwrap();
        let writer = PersistenceWriter::start(options(dir.path().to_path_buf())).unwrap();

        writer.execute(INSERT_AGGREGATE_SQL, insert_params(&make_row(1)));
        let stats = writer.close().unwrap();

        assert_eq!(stats.executed, 0);
        assert_eq!(stats.failed, 1);
        // Second close is a no-op
        assert_eq!(writer.close().unwrap(), WriterStats::default());
    }

    #[test]
    fn test_autocommitted_statements_do_not_trigger_threshold() {
        // Test: when BEGIN fails, statements autocommit and never count as outstanding
        let dir = tempdir().unwrap();
        let conn = open_database(&dir.path().join("probes.db")).unwrap();
        let mut worker = Worker {
            conn,
            commit_threshold: 2,
            in_transaction: false,
            outstanding: 0,
            stats: WriterStats::default(),
            connection_lost: Arc::new(AtomicBool::new(false)),
        };
        // A transaction the worker does not know about makes its BEGIN fail
        worker.conn.execute_batch("BEGIN").unwrap();

        for i in 0..5 {
            worker.execute(INSERT_AGGREGATE_SQL, &insert_params(&make_row(i)));
        }

        assert!(!worker.in_transaction);
        assert_eq!(worker.stats.executed, 5);
        assert_eq!(worker.outstanding, 0);
        assert_eq!(worker.stats.threshold_commits, 0);
    }

    #[test]
    fn test_connection_class_errors() {
        let failure = |code| rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None);

        assert!(is_connection_error(&failure(rusqlite::ffi::SQLITE_NOTADB)));
        assert!(is_connection_error(&failure(rusqlite::ffi::SQLITE_IOERR)));
        assert!(is_connection_error(&failure(rusqlite::ffi::SQLITE_CANTOPEN)));
        assert!(!is_connection_error(&failure(rusqlite::ffi::SQLITE_CONSTRAINT)));
        assert!(!is_connection_error(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn test_null_statistics_map_to_none() {
        let mut row = make_row(3);
        row.stats.rtt = None;
        let values = insert_params(&row);
        assert_eq!(values.len(), 21);
        assert_eq!(values[11], Value::Null);
        assert_eq!(row_to_aggregate(&values), Some(row));
    }
}
