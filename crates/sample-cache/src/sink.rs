//! Overflow sink contract

use thiserror::Error;

/// Overflow sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No storage session is open")]
    NotOpen,
    #[error("Storage write failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err.to_string())
    }
}

/// Append-only log that cache rotations are mirrored into
pub trait OverflowSink {
    /// Append one rotation to the log
    fn persist(&mut self, frame: &[u8]) -> Result<(), SinkError>;

    /// Bytes persisted so far
    fn size_bytes(&self) -> u64;
}

impl OverflowSink for Vec<u8> {
    fn persist(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        self.extend_from_slice(frame);
        self.push(b'\n');
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }
}
