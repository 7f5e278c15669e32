//! # Probe Store
//!
//! Turns a stream of per-probe RTT results into latency, jitter and loss
//! statistics at two resolutions:
//! - 300 s windows are always persisted
//! - 1 s windows are persisted only around loss events
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (ProbeRecord, PairedProbe, counters)
//! - `decoder` - 28-byte wire record codec
//! - `sequencer` - Per-session reordering and neighbor pairing
//! - `bucket` - Raw-sample buckets and order statistics
//! - `aggregator` - Highres/lowres buckets and the snapshot backlog
//! - `detector` - Loss events and highres retention
//! - `db` - Single-writer SQLite persistence
//! - `engine` - `ProbeStore` facade and query surface
//! - `scheduler` - Periodic flush, expiry, reload and rollup
//! - `ingestion` - Byte stream reader
//! - `config` - Environment configuration
//! - `error` - Error kinds

pub mod types;
pub mod error;
pub mod decoder;
pub mod sequencer;
pub mod bucket;
pub mod aggregator;
pub mod detector;
pub mod db;
pub mod engine;
pub mod scheduler;
pub mod ingestion;
pub mod config;

// Re-export commonly used types
pub use types::{
    AggregateStats, Counters, IntervalAggregate, PairedProbe, PersistedAggregate, ProbeRecord,
    ProbeState, Resolution, SampleStats, SessionId,
};
pub use error::{DecodeError, ProbeStoreError};
pub use sequencer::Sequencer;
pub use aggregator::DualResolutionAggregator;
pub use detector::{EventDetector, LinkState};
pub use db::{PersistenceWriter, WriterStats};
pub use engine::{ProbeStore, StorageStatistics};
pub use scheduler::{ConfigReloader, MaintenanceScheduler};
pub use ingestion::{run_ingestion, run_ingestion_until};
pub use config::ProbeStoreConfig;
