//! Vehicle-bus collaborator contract

use crate::error::ObdError;
use crate::pid::Pid;
use async_trait::async_trait;
use std::time::Duration;

/// Capabilities the telemetry engine needs from a vehicle-bus interface
///
/// Implementations wrap an ELM327-style adapter or a native CAN stack.
/// The engine treats a failed `init` as fatal and counts read failures
/// against an error budget.
#[async_trait]
pub trait VehicleBus: Send {
    /// Bring the adapter up and confirm the vehicle answers
    async fn init(&mut self) -> Result<(), ObdError>;

    /// Read and decode a single Mode 01 parameter
    async fn read_parameter(&mut self, pid: Pid) -> Result<i32, ObdError>;

    /// Read up to `max` stored trouble codes
    async fn read_dtcs(&mut self, max: usize) -> Result<Vec<u16>, ObdError>;

    /// Read the vehicle identification number
    async fn read_vin(&mut self) -> Result<String, ObdError>;

    /// Read the supply voltage seen by the adapter
    async fn battery_voltage(&mut self) -> Result<f32, ObdError>;

    /// Forward a raw diagnostic request and return the adapter's reply text
    async fn request(&mut self, command: &str, timeout: Duration) -> Result<String, ObdError>;

    /// Release the adapter before standby
    async fn shutdown(&mut self) {}
}
