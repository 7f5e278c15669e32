//! Error kinds for the probe store
//!
//! Each kind has a fixed recovery action:
//! - `Decode`: the record is dropped, ingestion continues
//! - `Persistence`: the statement is dropped, the writer continues
//! - `Connectivity`: retried at startup, fatal to the writer afterwards
//! - `Config`: reported to the caller, the core keeps running
//!
//! Missing neighbors during pairing are steady-state behavior and have no
//! error kind.

#[derive(Debug)]
pub enum DecodeError {
    /// Record is not exactly one wire record long
    WrongLength(usize),
    UnknownState(i32),
    InvalidNanoseconds { field: &'static str, value: i32 },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::WrongLength(len) => write!(f, "wrong record length: {} bytes", len),
            DecodeError::UnknownState(code) => write!(f, "unknown probe state code: {}", code),
            DecodeError::InvalidNanoseconds { field, value } => {
                write!(f, "{} out of range: {}", field, value)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug)]
pub enum ProbeStoreError {
    Decode(DecodeError),
    Persistence(String),
    Connectivity(String),
    Config(String),
    Io(std::io::Error),
}

impl From<DecodeError> for ProbeStoreError {
    fn from(err: DecodeError) -> Self {
        ProbeStoreError::Decode(err)
    }
}

impl From<std::io::Error> for ProbeStoreError {
    fn from(err: std::io::Error) -> Self {
        ProbeStoreError::Io(err)
    }
}

impl From<rusqlite::Error> for ProbeStoreError {
    fn from(err: rusqlite::Error) -> Self {
        ProbeStoreError::Persistence(err.to_string())
    }
}

impl std::fmt::Display for ProbeStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStoreError::Decode(e) => write!(f, "Decode error: {}", e),
            ProbeStoreError::Persistence(e) => write!(f, "Persistence error: {}", e),
            ProbeStoreError::Connectivity(e) => write!(f, "Connectivity error: {}", e),
            ProbeStoreError::Config(e) => write!(f, "Configuration error: {}", e),
            ProbeStoreError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ProbeStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeStoreError::Decode(e) => Some(e),
            ProbeStoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}
