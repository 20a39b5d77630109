//! Sample Cache
//!
//! Accumulates timestamped key/value samples as text between transmissions.
//! A rotation looks like `1A#0=5120,10D=62,10C=2150,30=41*7F`: feed id
//! header, samples, checksum tailer.

mod cache;
mod sink;

pub use cache::{SampleCache, DEFAULT_CAPACITY};
pub use sink::{OverflowSink, SinkError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample identifier; bit 0x100 marks values read from the vehicle bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey(pub u16);

impl SampleKey {
    /// Marks a key as carrying a vehicle-bus PID
    pub const VEHICLE_BUS: u16 = 0x100;

    pub const TIMESTAMP: Self = Self(0x00);
    pub const LATITUDE: Self = Self(0x0A);
    pub const LONGITUDE: Self = Self(0x0B);
    pub const ALTITUDE: Self = Self(0x0C);
    pub const GPS_SPEED: Self = Self(0x0D);
    pub const HEADING: Self = Self(0x0E);
    pub const SAT_COUNT: Self = Self(0x0F);
    pub const GPS_TIME: Self = Self(0x10);
    pub const GPS_DATE: Self = Self(0x11);
    pub const ACCELEROMETER: Self = Self(0x20);
    pub const GYROSCOPE: Self = Self(0x21);
    pub const MOTION_TEMP: Self = Self(0x23);
    pub const BATTERY_VOLTAGE: Self = Self(0x24);
    pub const TRIP_DISTANCE: Self = Self(0x30);
    pub const DATA_SIZE: Self = Self(0x80);
    pub const DEVICE_TEMP: Self = Self(0x82);

    /// Key for a value read from the vehicle bus
    pub fn vehicle(pid: u8) -> Self {
        Self(Self::VEHICLE_BUS | pid as u16)
    }

    pub fn is_vehicle_bus(&self) -> bool {
        self.0 & Self::VEHICLE_BUS != 0
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Sample payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleValue {
    Int(i32),
    /// Three-axis reading
    Triple(i32, i32, i32),
    /// Geographic coordinate in millionths of a degree
    Coordinate(i32),
    /// Value in hundredths (voltages)
    Centi(i32),
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SampleValue::Int(v) => write!(f, "{}", v),
            SampleValue::Triple(a, b, c) => write!(f, "{};{};{}", a, b, c),
            SampleValue::Coordinate(v) => write_fixed(f, v, 1_000_000, 6),
            SampleValue::Centi(v) => write_fixed(f, v, 100, 2),
        }
    }
}

fn write_fixed(f: &mut fmt::Formatter<'_>, value: i32, scale: i64, digits: usize) -> fmt::Result {
    let sign = if value < 0 { "-" } else { "" };
    let abs = (value as i64).abs();
    write!(f, "{}{}.{:0width$}", sign, abs / scale, abs % scale, width = digits)
}

/// One timestamped reading; immutable once built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub key: SampleKey,
    pub value: SampleValue,
    /// Device uptime in milliseconds
    pub timestamp_ms: u32,
}

impl Sample {
    pub fn new(key: SampleKey, value: SampleValue, timestamp_ms: u32) -> Self {
        Self {
            key,
            value,
            timestamp_ms,
        }
    }

    pub fn int(key: SampleKey, value: i32, timestamp_ms: u32) -> Self {
        Self::new(key, SampleValue::Int(value), timestamp_ms)
    }
}
