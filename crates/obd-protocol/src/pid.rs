//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the Mode 01 Parameter IDs (PIDs) the telemetry engine polls and
//! their decoding formulas. Decoded values are integers in the unit the
//! telemetry feed reports (km/h, rpm, %, °C, kPa, L/h).

use serde::{Deserialize, Serialize};

/// Mode 01 PIDs polled by the telemetry engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Intake air temperature (0x0F)
    IntakeTemp = 0x0F,
    /// Throttle position (0x11)
    Throttle = 0x11,
    /// Barometric pressure (0x33)
    BarometricPressure = 0x33,
    /// Ambient air temperature (0x46)
    AmbientTemp = 0x46,
    /// Engine fuel rate (0x5E)
    EngineFuelRate = 0x5E,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a PID by its hex value
    pub fn from_hex(value: u8) -> Option<Self> {
        let pid = match value {
            0x04 => Pid::EngineLoad,
            0x05 => Pid::CoolantTemp,
            0x0C => Pid::Rpm,
            0x0D => Pid::Speed,
            0x0F => Pid::IntakeTemp,
            0x11 => Pid::Throttle,
            0x33 => Pid::BarometricPressure,
            0x46 => Pid::AmbientTemp,
            0x5E => Pid::EngineFuelRate,
            _ => return None,
        };
        Some(pid)
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm | Pid::EngineFuelRate => 2,
            _ => 1,
        }
    }

    /// Decode the data bytes of a `41 <pid> A [B]` response
    pub fn decode(&self, bytes: &[u8]) -> Option<i32> {
        if bytes.len() < self.response_bytes() {
            return None;
        }
        let a = bytes[0] as i32;
        let value = match self {
            // RPM: ((A*256)+B)/4
            Pid::Rpm => (a * 256 + bytes[1] as i32) / 4,
            // Fuel rate: ((A*256)+B)/20 (L/h)
            Pid::EngineFuelRate => (a * 256 + bytes[1] as i32) / 20,
            // Speed (km/h), barometric pressure (kPa): A
            Pid::Speed | Pid::BarometricPressure => a,
            // Temperatures: A - 40 (°C)
            Pid::CoolantTemp | Pid::IntakeTemp | Pid::AmbientTemp => a - 40,
            // Load, throttle: A * 100 / 255 (%)
            Pid::EngineLoad | Pid::Throttle => a * 100 / 255,
        };
        Some(value)
    }
}

/// Response from a PID query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidResponse {
    /// The PID that was queried
    pub pid: Pid,
    /// Decoded value
    pub value: i32,
    /// Raw data bytes from the response
    pub raw_bytes: Vec<u8>,
}

impl PidResponse {
    /// Parse an adapter reply such as `41 0D 3C` or `410D3C`
    pub fn parse(pid: Pid, reply: &str) -> Option<Self> {
        let hex: String = reply.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        let header = format!("41{:02X}", pid.as_hex());
        let start = hex.to_ascii_uppercase().find(&header)? + header.len();
        let raw_bytes: Vec<u8> = hex[start..]
            .as_bytes()
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
            .take(pid.response_bytes())
            .collect();
        let value = pid.decode(&raw_bytes)?;
        Some(Self {
            pid,
            value,
            raw_bytes,
        })
    }
}

/// Render a stored trouble code in the standard `P0123` notation
pub fn format_dtc(code: u16) -> String {
    let system = match code >> 14 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!("{}{:04X}", system, code & 0x3FFF)
}

/// Fold an adapter reply onto one line
///
/// Carriage returns and line feeds become spaces and the trailing prompt
/// is dropped, so the text can travel inside a single telemetry field.
pub fn normalize_reply(raw: &str) -> String {
    raw.trim_end_matches('>')
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}
