//! Bench-host collaborators
//!
//! Used when `simulate = true`, or for the parts of the device a host build
//! has no hardware for (board, status display).

use crate::error::PeripheralError;
use crate::peripherals::{Board, GpsFix, MotionReading, MotionSource, PositionSource, StatusSurface};
use async_trait::async_trait;
use chrono::{Datelike, Timelike, Utc};
use tracing::{debug, info};

/// Position receiver that drives slowly north-east from a start point
pub struct SimulatedPosition {
    lat: i32,
    lng: i32,
    ready: bool,
}

impl SimulatedPosition {
    /// Start at the given coordinate (millionths of a degree)
    pub fn new(lat: i32, lng: i32) -> Self {
        Self {
            lat,
            lng,
            ready: false,
        }
    }
}

#[async_trait]
impl PositionSource for SimulatedPosition {
    async fn init(&mut self, baud: u32) -> Result<(), PeripheralError> {
        debug!("Simulated position source @ {} baud", baud);
        self.ready = true;
        Ok(())
    }

    async fn fix(&mut self) -> Option<GpsFix> {
        if !self.ready {
            return None;
        }
        let now = Utc::now();
        self.lat += 12;
        self.lng += 15;
        Some(GpsFix {
            date: now.day() * 10_000 + now.month() * 100 + now.year().rem_euclid(100) as u32,
            time: now.hour() * 1_000_000 + now.minute() * 10_000 + now.second() * 100,
            lat: self.lat,
            lng: self.lng,
            alt: 42,
            speed: 35,
            heading: 45,
            sat_count: 9,
        })
    }

    async fn shutdown(&mut self) {
        self.ready = false;
    }
}

/// Accelerometer resting flat, with a little sensor noise
pub struct SimulatedMotion {
    counts_per_g: i32,
    tick: u32,
}

impl SimulatedMotion {
    pub fn new(counts_per_g: f32) -> Self {
        Self {
            counts_per_g: counts_per_g as i32,
            tick: 0,
        }
    }
}

#[async_trait]
impl MotionSource for SimulatedMotion {
    async fn init(&mut self) -> Result<(), PeripheralError> {
        Ok(())
    }

    async fn read(&mut self) -> Option<MotionReading> {
        self.tick = self.tick.wrapping_add(1);
        let noise = (self.tick % 7) as i32 - 3;
        // a bump every few seconds wakes the device from standby
        let bump = if self.tick % 50 == 0 { self.counts_per_g / 2 } else { 0 };
        Some(MotionReading {
            acc: [noise + bump, -noise, self.counts_per_g + noise],
            gyro: Some([noise, 0, -noise]),
            temperature: Some(285),
        })
    }
}

/// Host board: restart and indicator changes are only logged
#[derive(Default)]
pub struct HostBoard {
    indicator: u8,
}

#[async_trait]
impl Board for HostBoard {
    async fn restart(&mut self) {
        info!("Board restart requested");
    }

    fn set_indicator(&mut self, mode: u8) {
        info!("Indicator mode {} -> {}", self.indicator, mode);
        self.indicator = mode;
    }

    fn temperature(&mut self) -> Option<i32> {
        None
    }
}

/// Status lines go to the log under the `status` target
#[derive(Default)]
pub struct TracingStatus;

impl StatusSurface for TracingStatus {
    fn print(&mut self, text: &str) {
        info!(target: "status", "{}", text);
    }
}
