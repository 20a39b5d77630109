//! Scripted collaborators for engine tests

use crate::error::{LinkError, PeripheralError};
use crate::peripherals::{
    Board, GpsFix, MotionReading, MotionSource, PositionSource, StatusSurface, Transport,
};
use async_trait::async_trait;
use obd_protocol::{ObdError, Pid, VehicleBus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wire_protocol::frame;

/// Seal `text` with its checksum trailer
pub fn sealed(text: &str) -> Vec<u8> {
    let mut buf = text.as_bytes().to_vec();
    frame::seal(&mut buf);
    buf
}

/// What the mock collector saw and will answer
#[derive(Debug)]
pub struct LinkLog {
    /// Every frame sent, as text
    pub sent: Vec<String>,
    /// Frames waiting to be received
    pub inbound: VecDeque<Vec<u8>>,
    pub opens: usize,
    pub closes: usize,
    pub fail_open: bool,
    pub fail_send: bool,
    /// Answer LOGIN, LOGOUT, and SYNC requests automatically
    pub auto_reply: bool,
    /// Flip a byte in every LOGIN reply so its checksum fails
    pub corrupt_login: bool,
    pub feed_id: u16,
    /// Unix time in LOGIN replies; `None` leaves `TM` out
    pub server_time: Option<i64>,
}

impl Default for LinkLog {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            inbound: VecDeque::new(),
            opens: 0,
            closes: 0,
            fail_open: false,
            fail_send: false,
            auto_reply: true,
            corrupt_login: false,
            feed_id: 26,
            server_time: Some(1_700_000_000),
        }
    }
}

impl LinkLog {
    /// Sent frames that carry `EV=<event>`
    pub fn sent_events(&self, event: u8) -> Vec<&String> {
        let prefix = format!("EV={},", event);
        self.sent.iter().filter(|f| f.starts_with(&prefix)).collect()
    }

    /// Sent data frames (feed header, no event)
    pub fn data_frames(&self) -> Vec<&String> {
        self.sent.iter().filter(|f| !f.starts_with("EV=")).collect()
    }
}

/// In-process collector
pub struct MockTransport {
    log: Arc<Mutex<LinkLog>>,
    open: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(LinkLog::default())),
            open: false,
        }
    }

    pub fn handle(&self) -> Arc<Mutex<LinkLog>> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, host: &str, _port: u16) -> Result<(), LinkError> {
        let mut log = self.log.lock().unwrap();
        log.opens += 1;
        if log.fail_open {
            return Err(LinkError::Open(host.to_string(), "refused".to_string()));
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
        self.open = false;
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        let mut log = self.log.lock().unwrap();
        let text = String::from_utf8_lossy(bytes).to_string();
        log.sent.push(text.clone());
        if log.fail_send {
            return Err(LinkError::Send("unreachable".to_string()));
        }
        if !log.auto_reply {
            return Ok(());
        }
        let event = text
            .strip_prefix("EV=")
            .and_then(|rest| rest.split(',').next())
            .and_then(|code| code.parse::<u8>().ok());
        let reply = match event {
            Some(1) => {
                let time = log
                    .server_time
                    .map(|secs| format!(",TM={}", secs))
                    .unwrap_or_default();
                let mut reply = sealed(&format!("EV=1,ID={}{},SN=mock", log.feed_id, time));
                if log.corrupt_login {
                    reply[3] ^= 0x01;
                }
                Some(reply)
            }
            Some(2) => Some(sealed("EV=2")),
            Some(4) => Some(sealed("EV=4")),
            _ => None,
        };
        if let Some(reply) = reply {
            log.inbound.push_back(reply);
        }
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Option<Vec<u8>> {
        if !self.open {
            return None;
        }
        self.log.lock().unwrap().inbound.pop_front()
    }

    fn device_name(&self) -> String {
        "mock".to_string()
    }
}

/// Vehicle bus with scripted speed readings
pub struct MockBus {
    speeds: Vec<i32>,
    speed_failures: u32,
    init_fails: bool,
    diagnostic_reply: Option<String>,
    reads: Arc<Mutex<Vec<Pid>>>,
    tick: usize,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            speeds: vec![40, 42, 44, 46],
            speed_failures: 0,
            init_fails: false,
            diagnostic_reply: Some("41 0C 1A 2B\r\r>".to_string()),
            reads: Arc::new(Mutex::new(Vec::new())),
            tick: 0,
        }
    }

    /// Fail the next `count` speed reads
    pub fn failing_speed(mut self, count: u32) -> Self {
        self.speed_failures = count;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.init_fails = true;
        self
    }

    /// Never answer diagnostic requests
    pub fn silent(mut self) -> Self {
        self.diagnostic_reply = None;
        self
    }

    /// PIDs read so far, in order
    pub fn reads(&self) -> Arc<Mutex<Vec<Pid>>> {
        Arc::clone(&self.reads)
    }
}

#[async_trait]
impl VehicleBus for MockBus {
    async fn init(&mut self) -> Result<(), ObdError> {
        if self.init_fails {
            return Err(ObdError::VehicleNotConnected);
        }
        Ok(())
    }

    async fn read_parameter(&mut self, pid: Pid) -> Result<i32, ObdError> {
        self.reads.lock().unwrap().push(pid);
        if pid != Pid::Speed {
            return Ok(pid.as_hex() as i32);
        }
        if self.speed_failures > 0 {
            self.speed_failures -= 1;
            return Err(ObdError::Timeout(100));
        }
        let speed = self.speeds[self.tick % self.speeds.len()];
        self.tick += 1;
        Ok(speed)
    }

    async fn read_dtcs(&mut self, max: usize) -> Result<Vec<u16>, ObdError> {
        Ok(vec![0x0123].into_iter().take(max).collect())
    }

    async fn read_vin(&mut self) -> Result<String, ObdError> {
        Ok("WDB2030461A000001".to_string())
    }

    async fn battery_voltage(&mut self) -> Result<f32, ObdError> {
        Ok(12.6)
    }

    async fn request(&mut self, _command: &str, timeout: Duration) -> Result<String, ObdError> {
        match &self.diagnostic_reply {
            Some(reply) => Ok(reply.clone()),
            None => {
                tokio::time::sleep(timeout * 2).await;
                Err(ObdError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct BoardLog {
    /// Indicator modes in the order they were set
    pub indicator: Vec<u8>,
    pub restarts: usize,
}

#[derive(Default)]
pub struct MockBoard {
    log: Arc<Mutex<BoardLog>>,
    temperature: Option<i32>,
}

impl MockBoard {
    pub fn with_temperature(tenths: i32) -> Self {
        Self {
            temperature: Some(tenths),
            ..Self::default()
        }
    }

    pub fn handle(&self) -> Arc<Mutex<BoardLog>> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl Board for MockBoard {
    async fn restart(&mut self) {
        self.log.lock().unwrap().restarts += 1;
    }

    fn set_indicator(&mut self, mode: u8) {
        self.log.lock().unwrap().indicator.push(mode);
    }

    fn temperature(&mut self) -> Option<i32> {
        self.temperature
    }
}

/// Status lines printed so far
#[derive(Default)]
pub struct MockStatus {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MockStatus {
    pub fn handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.lines)
    }
}

impl StatusSurface for MockStatus {
    fn print(&mut self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}

/// Position receiver holding one fix
pub struct MockPosition {
    fix: Option<GpsFix>,
}

impl MockPosition {
    pub fn with_fix(fix: GpsFix) -> Self {
        Self { fix: Some(fix) }
    }

    pub fn no_fix() -> Self {
        Self { fix: None }
    }
}

#[async_trait]
impl PositionSource for MockPosition {
    async fn init(&mut self, _baud: u32) -> Result<(), PeripheralError> {
        Ok(())
    }

    async fn fix(&mut self) -> Option<GpsFix> {
        self.fix
    }
}

/// Accelerometer that sits still, then optionally starts moving
pub struct MockMotion {
    rest: [i32; 3],
    moving_after: Option<usize>,
    reads: usize,
}

impl MockMotion {
    pub fn at_rest(rest: [i32; 3]) -> Self {
        Self {
            rest,
            moving_after: None,
            reads: 0,
        }
    }

    /// Report a half-g bump on X once `reads` readings have been taken
    pub fn moving_after(mut self, reads: usize) -> Self {
        self.moving_after = Some(reads);
        self
    }
}

#[async_trait]
impl MotionSource for MockMotion {
    async fn init(&mut self) -> Result<(), PeripheralError> {
        Ok(())
    }

    async fn read(&mut self) -> Option<MotionReading> {
        self.reads += 1;
        let mut acc = self.rest;
        if self.moving_after.is_some_and(|after| self.reads > after) {
            acc[0] += 8192;
        }
        Some(MotionReading {
            acc,
            gyro: None,
            temperature: None,
        })
    }
}
