//! Probe store configuration from environment variables

use super::error::ProbeStoreError;
use super::sequencer::DEFAULT_WRAPAROUND_GAP;
use super::types::NANOS_PER_SEC;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the probe store and its runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct ProbeStoreConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,

    /// Byte stream written by the prober
    pub fifo_path: PathBuf,

    /// Highres data kept on each side of a loss event, seconds
    pub look_around_secs: u64,

    /// Probe timeout configured in the prober, seconds
    pub probe_timeout_secs: u64,

    /// Extra wait before a window counts as resolved, seconds
    pub processing_slack_secs: u64,

    /// Scheduler tick in milliseconds
    pub flush_interval_ms: u64,

    pub delete_interval_secs: u64,
    pub reload_interval_secs: u64,

    /// Age after which 1 s rows are deleted, seconds
    pub highres_retention_secs: u64,

    /// Age after which 300 s rows are deleted, seconds
    pub lowres_retention_secs: u64,

    /// Outstanding mutations that force a commit
    pub commit_threshold: usize,

    /// Fixed backoff between database connect attempts, milliseconds
    pub connect_retry_ms: u64,

    pub wraparound_gap: u32,

    /// Only raise loss events for a dead target when its state changes
    pub suppress_down_sessions: bool,
}

impl Default for ProbeStoreConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Upper bound for every `*_secs` setting (ten years)
pub const MAX_SECS: u64 = 10 * 365 * 86_400;

/// Seconds to nanoseconds, saturating instead of wrapping
fn secs_to_ns(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(NANOS_PER_SEC)
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl ProbeStoreConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PROBE_STORE_DB_PATH` (default: /var/lib/probe-store/probes.db)
    /// - `PROBE_STORE_FIFO_PATH` (default: /tmp/probed.fifo)
    /// - `PROBE_STORE_LOOK_AROUND_SECS` (default: 10)
    /// - `PROBE_STORE_PROBE_TIMEOUT_SECS` (default: 1)
    /// - `PROBE_STORE_PROCESSING_SLACK_SECS` (default: 1)
    /// - `PROBE_STORE_FLUSH_INTERVAL_MS` (default: 1000)
    /// - `PROBE_STORE_DELETE_INTERVAL_SECS` (default: 600)
    /// - `PROBE_STORE_RELOAD_INTERVAL_SECS` (default: 3600)
    /// - `PROBE_STORE_HIGHRES_RETENTION_SECS` (default: 1800)
    /// - `PROBE_STORE_LOWRES_RETENTION_SECS` (default: 86400)
    /// - `PROBE_STORE_COMMIT_THRESHOLD` (default: 10000)
    /// - `PROBE_STORE_CONNECT_RETRY_MS` (default: 1000)
    /// - `PROBE_STORE_WRAPAROUND_GAP` (default: 1000000)
    /// - `PROBE_STORE_SUPPRESS_DOWN_SESSIONS` (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    ///
    /// Unset or unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db_path: lookup("PROBE_STORE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/probe-store/probes.db")),

            fifo_path: lookup("PROBE_STORE_FIFO_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/probed.fifo")),

            look_around_secs: parsed(&lookup, "PROBE_STORE_LOOK_AROUND_SECS", 10),
            probe_timeout_secs: parsed(&lookup, "PROBE_STORE_PROBE_TIMEOUT_SECS", 1),
            processing_slack_secs: parsed(&lookup, "PROBE_STORE_PROCESSING_SLACK_SECS", 1),
            flush_interval_ms: parsed(&lookup, "PROBE_STORE_FLUSH_INTERVAL_MS", 1_000),
            delete_interval_secs: parsed(&lookup, "PROBE_STORE_DELETE_INTERVAL_SECS", 600),
            reload_interval_secs: parsed(&lookup, "PROBE_STORE_RELOAD_INTERVAL_SECS", 3_600),
            highres_retention_secs: parsed(&lookup, "PROBE_STORE_HIGHRES_RETENTION_SECS", 1_800),
            lowres_retention_secs: parsed(&lookup, "PROBE_STORE_LOWRES_RETENTION_SECS", 86_400),
            commit_threshold: parsed(&lookup, "PROBE_STORE_COMMIT_THRESHOLD", 10_000),
            connect_retry_ms: parsed(&lookup, "PROBE_STORE_CONNECT_RETRY_MS", 1_000),
            wraparound_gap: parsed(&lookup, "PROBE_STORE_WRAPAROUND_GAP", DEFAULT_WRAPAROUND_GAP),
            suppress_down_sessions: parsed(&lookup, "PROBE_STORE_SUPPRESS_DOWN_SESSIONS", false),
        }
    }

    /// Reject values the store cannot run with
    pub fn validate(&self) -> Result<(), ProbeStoreError> {
        let bounded = [
            ("look-around interval", self.look_around_secs),
            ("probe timeout", self.probe_timeout_secs),
            ("processing slack", self.processing_slack_secs),
            ("delete interval", self.delete_interval_secs),
            ("reload interval", self.reload_interval_secs),
            ("highres retention", self.highres_retention_secs),
            ("lowres retention", self.lowres_retention_secs),
        ];
        for (name, secs) in bounded {
            if secs > MAX_SECS {
                return Err(ProbeStoreError::Config(format!(
                    "{} of {}s exceeds the maximum of {}s",
                    name, secs, MAX_SECS
                )));
            }
        }
        if self.look_around_secs == 0 {
            return Err(ProbeStoreError::Config("look-around interval must be positive".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ProbeStoreError::Config("flush interval must be positive".to_string()));
        }
        if self.commit_threshold == 0 {
            return Err(ProbeStoreError::Config("commit threshold must be positive".to_string()));
        }
        if self.highres_retention_secs > self.lowres_retention_secs {
            return Err(ProbeStoreError::Config(format!(
                "highres retention ({}s) exceeds lowres retention ({}s)",
                self.highres_retention_secs, self.lowres_retention_secs
            )));
        }
        Ok(())
    }

    pub fn look_around_ns(&self) -> i64 {
        secs_to_ns(self.look_around_secs)
    }

    /// Probe timeout plus processing slack
    pub fn resolution_delay_ns(&self) -> i64 {
        self.probe_timeout_ns()
            .saturating_add(secs_to_ns(self.processing_slack_secs))
    }

    /// Time before a window is final: look-around + probe timeout + slack
    pub fn safety_delay_ns(&self) -> i64 {
        self.look_around_ns().saturating_add(self.resolution_delay_ns())
    }

    /// How long highres snapshots stay in the in-memory backlog
    pub fn backlog_horizon_ns(&self) -> i64 {
        self.look_around_ns()
            .saturating_mul(2)
            .saturating_add(self.resolution_delay_ns())
    }

    pub fn probe_timeout_ns(&self) -> i64 {
        secs_to_ns(self.probe_timeout_secs)
    }

    pub fn delete_interval_ns(&self) -> i64 {
        secs_to_ns(self.delete_interval_secs)
    }

    pub fn reload_interval_ns(&self) -> i64 {
        secs_to_ns(self.reload_interval_secs)
    }

    pub fn highres_retention_ns(&self) -> i64 {
        secs_to_ns(self.highres_retention_secs)
    }

    pub fn lowres_retention_ns(&self) -> i64 {
        secs_to_ns(self.lowres_retention_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}
