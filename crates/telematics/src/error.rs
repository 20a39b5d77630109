//! Telematics Error Types

use obd_protocol::ObdError;
use thiserror::Error;
use wire_protocol::{Event, ProtocolError};

/// Network link failures
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link not open")]
    NotOpen,
    #[error("Failed to open link to {0}: {1}")]
    Open(String, String),
    #[error("Send failed: {0}")]
    Send(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Send(err.to_string())
    }
}

/// Optional peripheral failures (position, motion)
#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("{0} failed to initialize: {1}")]
    Init(&'static str, String),
}

/// Session lifecycle failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Vehicle bus unavailable: {0}")]
    VehicleBus(#[from] ObdError),

    #[error("Network link unavailable: {0}")]
    Link(#[from] LinkError),

    #[error("No reply to {0}")]
    NoReply(Event),

    #[error("Invalid reply: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Setup failed after {0} attempts")]
    SetupExhausted(u32),
}
