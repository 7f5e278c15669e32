pub mod probe_store;

pub use probe_store::{ProbeStore, ProbeStoreConfig, ProbeStoreError};
