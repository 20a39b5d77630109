//! Device uptime and wall clock

use chrono::{DateTime, Datelike, Utc};
use tokio::time::Instant;

/// Uptime counter plus a wall-clock offset learned from the server
#[derive(Debug, Clone)]
pub struct DeviceClock {
    started: Instant,
    /// Server Unix time minus uptime seconds at the moment it was learned
    offset: Option<i64>,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            offset: None,
        }
    }

    /// Milliseconds since start, as carried in `TS=`
    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Sample timestamp (wraps after ~49 days)
    pub fn sample_ts(&self) -> u32 {
        self.uptime_ms() as u32
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Adopt the server's Unix time
    pub fn set_wall_time(&mut self, unix_secs: i64) {
        self.offset = Some(unix_secs - self.uptime_secs() as i64);
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        let secs = self.offset? + self.uptime_secs() as i64;
        DateTime::from_timestamp(secs, 0)
    }

    /// Current calendar date as `DDMMYY`
    pub fn date(&self) -> Option<u32> {
        self.now().map(|now| ddmmyy(&now))
    }
}

impl Default for DeviceClock {
    fn default() -> Self {
        Self::new()
    }
}

fn ddmmyy(date: &DateTime<Utc>) -> u32 {
    date.day() * 10_000 + date.month() * 100 + (date.year().rem_euclid(100)) as u32
}
