//! Device readiness and lifecycle state

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Subsystems that have come up successfully
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const STORAGE = 0x01;
        const VEHICLE_BUS = 0x02;
        const POSITION = 0x04;
        const MOTION = 0x08;
        const NETWORK_LINK = 0x10;
        const SESSION_CONNECTED = 0x20;
        const ALL_SYSTEMS_GO = 0x40;
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::empty()
    }
}

impl Readiness {
    /// Flags that must hold before `ALL_SYSTEMS_GO` may be set
    ///
    /// Position, motion, and storage are soft dependencies and never gate it.
    pub fn required(vehicle_bus_enabled: bool) -> Self {
        let mut required = Self::NETWORK_LINK | Self::SESSION_CONNECTED;
        if vehicle_bus_enabled {
            required |= Self::VEHICLE_BUS;
        }
        required
    }

    /// Set `ALL_SYSTEMS_GO` if every required flag holds
    pub fn try_all_go(&mut self, vehicle_bus_enabled: bool) -> bool {
        let ready = self.contains(Self::required(vehicle_bus_enabled));
        self.set(Self::ALL_SYSTEMS_GO, ready);
        ready
    }

    /// Clear a flag and, with it, `ALL_SYSTEMS_GO`
    pub fn lose(&mut self, flag: Self) {
        self.remove(flag | Self::ALL_SYSTEMS_GO);
    }

    pub fn all_go(&self) -> bool {
        self.contains(Self::ALL_SYSTEMS_GO)
    }
}

/// Lifecycle of the telemetry session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Connected,
    Degraded,
    Standby,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Connected => "connected",
            SessionState::Degraded => "degraded",
            SessionState::Standby => "standby",
        };
        f.write_str(name)
    }
}
