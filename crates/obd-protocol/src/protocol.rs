//! Adapter bus-protocol selection

use serde::{Deserialize, Serialize};

/// Vehicle bus protocols an ELM327 adapter can be pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Let the adapter search
    #[default]
    Auto,
    J1850Pwm,
    J1850Vpw,
    Iso9141,
    /// ISO 14230-4 KWP, fast init
    Kwp2000,
    /// ISO 15765-4 CAN, 11 bit ID, 500 kbaud
    Can11bit500,
    /// ISO 15765-4 CAN, 29 bit ID, 500 kbaud
    Can29bit500,
    /// ISO 15765-4 CAN, 11 bit ID, 250 kbaud
    Can11bit250,
    /// ISO 15765-4 CAN, 29 bit ID, 250 kbaud
    Can29bit250,
}

impl ObdProtocol {
    /// The `ATSP` command that selects this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141 => "ATSP3",
            ObdProtocol::Kwp2000 => "ATSP5",
            ObdProtocol::Can11bit500 => "ATSP6",
            ObdProtocol::Can29bit500 => "ATSP7",
            ObdProtocol::Can11bit250 => "ATSP8",
            ObdProtocol::Can29bit250 => "ATSP9",
        }
    }

    /// CAN replies carry a byte count after the mode byte in Mode 03
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Can11bit500
                | ObdProtocol::Can29bit500
                | ObdProtocol::Can11bit250
                | ObdProtocol::Can29bit250
        )
    }
}
