//! Event vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event numbers carried in the `EV=` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Event {
    /// Open a session and obtain a feed identifier
    Login = 1,
    /// Close the session
    Logout = 2,
    /// Remote command from the collector
    Command = 3,
    /// Heartbeat
    Sync = 4,
    /// Command acknowledgment
    Ack = 5,
}

impl Event {
    /// Wire number of this event
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Look up an event by its wire number
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Event::Login),
            2 => Some(Event::Logout),
            3 => Some(Event::Command),
            4 => Some(Event::Sync),
            5 => Some(Event::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Login => "LOGIN",
            Event::Logout => "LOGOUT",
            Event::Command => "COMMAND",
            Event::Sync => "SYNC",
            Event::Ack => "ACK",
        };
        write!(f, "{}", name)
    }
}
