//! Collaborator contracts the session engine drives
//!
//! Hardware drivers, network stacks, and displays live outside this crate;
//! the engine only sees these traits and holds them as trait objects chosen
//! at start-up.

use crate::error::{LinkError, PeripheralError};
use async_trait::async_trait;
use obd_protocol::VehicleBus;
use std::time::Duration;
use storage::PersistentStorage;

/// Datagram or line-oriented link to the collector
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self, host: &str, port: u16) -> Result<(), LinkError>;

    async fn close(&mut self);

    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Next inbound frame, or `None` if nothing arrives within `timeout`
    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    /// Human-readable name of the link hardware
    fn device_name(&self) -> String;
}

/// A position fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpsFix {
    /// `DDMMYY`
    pub date: u32,
    /// `HHMMSSmm`
    pub time: u32,
    /// Millionths of a degree
    pub lat: i32,
    pub lng: i32,
    /// Meters
    pub alt: i32,
    /// km/h
    pub speed: i32,
    pub heading: i32,
    pub sat_count: u8,
}

#[async_trait]
pub trait PositionSource: Send {
    async fn init(&mut self, baud: u32) -> Result<(), PeripheralError>;

    /// Latest fix, if the receiver has one
    async fn fix(&mut self) -> Option<GpsFix>;

    async fn shutdown(&mut self) {}
}

/// One motion sensor reading in raw counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionReading {
    pub acc: [i32; 3],
    pub gyro: Option<[i32; 3]>,
    /// Tenths of a degree Celsius
    pub temperature: Option<i32>,
}

#[async_trait]
pub trait MotionSource: Send {
    async fn init(&mut self) -> Result<(), PeripheralError>;

    async fn read(&mut self) -> Option<MotionReading>;
}

/// The device the engine runs on
#[async_trait]
pub trait Board: Send {
    /// Power-cycle the device; storage has been flushed already
    async fn restart(&mut self);

    fn set_indicator(&mut self, mode: u8);

    /// Board temperature in tenths of a degree Celsius
    fn temperature(&mut self) -> Option<i32>;
}

/// Operator-facing status line sink (companion display, console)
pub trait StatusSurface: Send {
    fn print(&mut self, text: &str);
}

/// Everything the session talks to
pub struct Peripherals {
    pub transport: Box<dyn Transport>,
    pub vehicle: Option<Box<dyn VehicleBus>>,
    pub position: Option<Box<dyn PositionSource>>,
    pub motion: Option<Box<dyn MotionSource>>,
    pub storage: Option<Box<dyn PersistentStorage>>,
    pub board: Box<dyn Board>,
    pub status: Box<dyn StatusSurface>,
}
