//! Telemetry Session Engine
//!
//! Brings up the vehicle bus, position and motion sensors, persistent
//! storage, and the uplink to the collector, then runs the
//! sample / transmit / command loop. Samples are batched in a bounded
//! cache; frames that cannot be sent are forwarded into dated storage
//! logs. Remote commands are de-duplicated by token and acknowledged.

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod peripherals;
pub mod pipeline;
pub mod readiness;
pub mod retry;
pub mod session;
pub mod sim;
pub mod transport;

#[cfg(test)]
mod testing;

pub use command::{Command, CommandDispatcher, CommandExecutor};
pub use config::{ConfigError, LoggingConfig, TelemetryConfig};
pub use error::{LinkError, PeripheralError, SessionError};
pub use peripherals::Peripherals;
pub use readiness::{Readiness, SessionState};
pub use retry::RetryPolicy;
pub use session::Session;

use anyhow::Context;
use obd_protocol::{Elm327Bus, SimulatedBus, VehicleBus};
use storage::{FileStorage, PersistentStorage};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Where the simulated position source starts (millionths of a degree)
const SIM_ORIGIN: (i32, i32) = (48_137_154, 11_576_124);

const SIM_VIN: &str = "WVWZZZ1JZXW000001";

/// Install the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level: Level = config
        .level
        .parse()
        .with_context(|| format!("unknown log level {:?}", config.level))?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    let installed = if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("Failed to set tracing subscriber")
}

/// Wire up the collaborators named by `config`
///
/// Disabled subsystems are left out. With `simulate` set, the vehicle bus,
/// position, and motion sources are simulated; otherwise the vehicle bus is
/// an ELM327 adapter and position/motion need a board-specific driver.
pub fn build_peripherals(config: &TelemetryConfig) -> Peripherals {
    let subsystems = &config.subsystems;

    let vehicle: Option<Box<dyn VehicleBus>> = if !subsystems.vehicle_bus {
        None
    } else if config.simulate {
        Some(Box::new(SimulatedBus::new(SIM_VIN)))
    } else {
        match Elm327Bus::open_serial(
            &subsystems.adapter_device,
            subsystems.adapter_baud,
            subsystems.adapter_protocol,
        ) {
            Ok(bus) => Some(Box::new(bus)),
            Err(e) => {
                warn!("Vehicle bus adapter unavailable: {}", e);
                None
            }
        }
    };

    let position: Option<Box<dyn peripherals::PositionSource>> =
        if subsystems.position && config.simulate {
            Some(Box::new(sim::SimulatedPosition::new(SIM_ORIGIN.0, SIM_ORIGIN.1)))
        } else {
            None
        };
    let motion: Option<Box<dyn peripherals::MotionSource>> =
        if subsystems.motion && config.simulate {
            Some(Box::new(sim::SimulatedMotion::new(config.motion.counts_per_g)))
        } else {
            None
        };
    if !config.simulate && (subsystems.position || subsystems.motion) {
        info!("No position or motion driver on this host; running without them");
    }

    let storage: Option<Box<dyn PersistentStorage>> = if subsystems.storage {
        Some(Box::new(FileStorage::new(&config.storage.path)))
    } else {
        None
    };

    Peripherals {
        transport: transport::build_transport(&config.link),
        vehicle,
        position,
        motion,
        storage,
        board: Box::new(sim::HostBoard::default()),
        status: Box::new(sim::TracingStatus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_peripherals() {
        let mut config = TelemetryConfig::default();
        config.simulate = true;
        config.subsystems.storage = false;
        let peripherals = build_peripherals(&config);
        assert!(peripherals.vehicle.is_some());
        assert!(peripherals.position.is_some());
        assert!(peripherals.motion.is_some());
        assert!(peripherals.storage.is_none());
    }

    #[test]
    fn test_disabled_subsystems_are_absent() {
        let mut config = TelemetryConfig::default();
        config.simulate = true;
        config.subsystems.vehicle_bus = false;
        config.subsystems.position = false;
        config.subsystems.motion = false;
        let peripherals = build_peripherals(&config);
        assert!(peripherals.vehicle.is_none());
        assert!(peripherals.position.is_none());
        assert!(peripherals.motion.is_none());
        assert!(peripherals.storage.is_some());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            json: false,
        };
        assert!(init_logging(&config).is_err());
    }
}
