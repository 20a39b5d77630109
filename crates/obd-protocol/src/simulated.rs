//! Simulated vehicle bus for bench runs without hardware

use crate::bus::VehicleBus;
use crate::error::ObdError;
use crate::pid::{Pid, PidResponse};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::{debug, info};

/// Vehicle bus that answers with plausible, deterministic values
pub struct SimulatedBus {
    vin: String,
    dtcs: Vec<u16>,
    tick: u64,
    initialized: bool,
}

impl SimulatedBus {
    /// Create a simulated bus reporting the given VIN
    pub fn new(vin: &str) -> Self {
        info!("Creating simulated vehicle bus (VIN {})", vin);
        Self {
            vin: vin.to_string(),
            dtcs: Vec::new(),
            tick: 0,
            initialized: false,
        }
    }

    /// Report stored trouble codes from `read_dtcs`
    pub fn with_dtcs(mut self, dtcs: Vec<u16>) -> Self {
        self.dtcs = dtcs;
        self
    }

    /// Build the adapter reply a real vehicle would give for `pid`
    fn reply_for(&mut self, pid: Pid) -> String {
        self.tick += 1;
        let mut hasher = DefaultHasher::new();
        self.tick.hash(&mut hasher);
        pid.hash(&mut hasher);
        let hash = hasher.finish();

        let data: Vec<u8> = match pid {
            // RPM: 800-3500 RPM range
            Pid::Rpm => {
                let encoded = (800 + (hash % 2700) as u16) * 4;
                vec![(encoded >> 8) as u8, (encoded & 0xFF) as u8]
            }
            // Speed: 0-120 km/h
            Pid::Speed => vec![(hash % 120) as u8],
            // Coolant 70-105°C, intake/ambient 10-45°C (stored as value + 40)
            Pid::CoolantTemp => vec![(110 + (hash % 35)) as u8],
            Pid::IntakeTemp | Pid::AmbientTemp => vec![(50 + (hash % 35)) as u8],
            // Load and throttle: 20-80%
            Pid::EngineLoad | Pid::Throttle => vec![(51 + (hash % 153)) as u8],
            Pid::BarometricPressure => vec![(95 + (hash % 10)) as u8],
            // Fuel rate: 0.5-10 L/h
            Pid::EngineFuelRate => {
                let encoded = 10 + (hash % 190) as u16;
                vec![(encoded >> 8) as u8, (encoded & 0xFF) as u8]
            }
        };

        let mut reply = format!("41 {:02X}", pid.as_hex());
        for byte in data {
            reply.push_str(&format!(" {:02X}", byte));
        }
        reply.push_str("\r\r>");
        reply
    }
}

#[async_trait]
impl VehicleBus for SimulatedBus {
    async fn init(&mut self) -> Result<(), ObdError> {
        debug!("Simulated bus: skipping adapter initialization");
        self.initialized = true;
        Ok(())
    }

    async fn read_parameter(&mut self, pid: Pid) -> Result<i32, ObdError> {
        if !self.initialized {
            return Err(ObdError::AdapterNotResponding);
        }
        let reply = self.reply_for(pid);
        PidResponse::parse(pid, &reply)
            .map(|response| response.value)
            .ok_or(ObdError::InvalidResponse(reply))
    }

    async fn read_dtcs(&mut self, max: usize) -> Result<Vec<u16>, ObdError> {
        Ok(self.dtcs.iter().copied().take(max).collect())
    }

    async fn read_vin(&mut self) -> Result<String, ObdError> {
        Ok(self.vin.clone())
    }

    async fn battery_voltage(&mut self) -> Result<f32, ObdError> {
        Ok(12.6)
    }

    async fn request(&mut self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        if !self.initialized {
            return Err(ObdError::Timeout(timeout.as_millis() as u64));
        }
        let command = command.trim().to_ascii_uppercase();
        let reply = match command.as_str() {
            "ATRV" => "12.6V\r>".to_string(),
            "ATI" => "ELM327 v1.5\r>".to_string(),
            _ => {
                let pid = command
                    .strip_prefix("01")
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .and_then(Pid::from_hex);
                match pid {
                    Some(pid) => self.reply_for(pid),
                    None => "NO DATA\r\r>".to_string(),
                }
            }
        };
        Ok(reply)
    }

    async fn shutdown(&mut self) {
        self.initialized = false;
    }
}
