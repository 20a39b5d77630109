//! OBD-II Vehicle-Bus Contract
//!
//! This crate defines what the telemetry engine needs from a vehicle-bus
//! interface: the PIDs it polls and how they decode, trouble-code and
//! diagnostic-reply formatting, and the async `VehicleBus` trait. It ships
//! an ELM327 adapter driver and a simulated bus for bench runs.

mod bus;
mod elm327;
mod error;
mod pid;
mod protocol;
mod simulated;

pub use bus::VehicleBus;
pub use elm327::Elm327Bus;
pub use error::ObdError;
pub use pid::{format_dtc, normalize_reply, Pid, PidResponse};
pub use protocol::ObdProtocol;
pub use simulated::SimulatedBus;
