//! Storage Layer
//!
//! Persistent append log that cache rotations overflow into. Storage is a
//! soft dependency of the telemetry engine: a failed `init` leaves the
//! device running without it.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::{MemoryLog, MemoryStorage};

use sample_cache::OverflowSink;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage media unavailable: {0}")]
    Unavailable(String),
    #[error("Storage not initialized")]
    NotInitialized,
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Persistent media holding one log session per calendar day
pub trait PersistentStorage: OverflowSink + Send {
    /// Mount the media; fails without side effects if it is absent
    fn init(&mut self) -> Result<(), StorageError>;

    /// Open the session for `date` (`DDMMYY`, 0 when unknown)
    fn begin(&mut self, date: u32) -> Result<(), StorageError>;

    /// Flush and close the open session
    fn end(&mut self);

    fn is_open(&self) -> bool;
}

/// Session name for a `DDMMYY` date
pub(crate) fn session_name(date: u32) -> String {
    if date == 0 {
        "UNDATED.TXT".to_string()
    } else {
        format!("{:06}.TXT", date)
    }
}
