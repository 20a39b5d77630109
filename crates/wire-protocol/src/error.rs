//! Protocol Error Types

use thiserror::Error;

/// Reasons an inbound frame is rejected
///
/// Every variant is treated by the session engine as "no reply".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// No `*` separator before the checksum
    #[error("Frame has no checksum separator")]
    MissingChecksum,

    /// Checksum digits are not two hex digits
    #[error("Malformed checksum field: {0:?}")]
    MalformedChecksum(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Frame body is not valid UTF-8 text
    #[error("Frame body is not text")]
    NotText,

    /// Reply does not echo the event of the request it answers
    #[error("Expected reply to event {expected}, got {found:?}")]
    EventMismatch { expected: u8, found: Option<u8> },

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Field present but unparseable
    #[error("Invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}
