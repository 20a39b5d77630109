//! Engine configuration
//!
//! Loaded from an optional TOML file and `TELEMATICS__<SECTION>__<KEY>`
//! environment overrides. Every section has working defaults.

use crate::retry::RetryPolicy;
use obd_protocol::{ObdProtocol, Pid};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Device name reported at login
    pub device_id: String,
    pub server: ServerConfig,
    pub link: LinkConfig,
    pub timing: TimingConfig,
    pub health: HealthConfig,
    /// Retry policy for link open, login, sync, and ACK sends
    pub retry: RetryPolicy,
    /// Retry policy for the whole setup sequence
    pub setup_retry: RetryPolicy,
    pub cache: CacheConfig,
    pub subsystems: SubsystemConfig,
    pub pipeline: PipelineConfig,
    pub motion: MotionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    /// Wire simulated vehicle, position, and motion sources
    pub simulate: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_id: "TELEMATICS-0001".to_string(),
            server: ServerConfig::default(),
            link: LinkConfig::default(),
            timing: TimingConfig::default(),
            health: HealthConfig::default(),
            retry: RetryPolicy::default(),
            setup_retry: RetryPolicy::fixed(3, 3000),
            cache: CacheConfig::default(),
            subsystems: SubsystemConfig::default(),
            pipeline: PipelineConfig::default(),
            motion: MotionConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            simulate: false,
        }
    }
}

impl TelemetryConfig {
    /// Load from `path` (if given and present) plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Self = builder
            .add_source(config::Environment::with_prefix("TELEMATICS").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.health.reconnect_threshold == 0 {
            return invalid("health.reconnect_threshold must be at least 1");
        }
        if self.health.max_errors < self.health.reconnect_threshold {
            return invalid("health.max_errors must not be below health.reconnect_threshold");
        }
        if self.health.obd_error_budget == 0 {
            return invalid("health.obd_error_budget must be at least 1");
        }
        if self.retry.max_attempts == 0 || self.setup_retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.cache.capacity < 32 {
            return invalid("cache.capacity must be at least 32 bytes");
        }
        if self.pipeline.low_priority_every == 0 || self.pipeline.device_temp_every == 0 {
            return invalid("pipeline rotation periods must be at least 1");
        }
        if self.motion.calibration_samples == 0 || self.motion.counts_per_g <= 0.0 {
            return invalid("motion calibration settings must be positive");
        }
        Ok(())
    }
}

/// Collector endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Optional key sent as `SK=` with every request
    pub key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            key: None,
        }
    }
}

/// Transport variant chosen at start-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Udp,
    Serial,
}

/// Network link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub kind: LinkKind,
    /// Serial device path (serial variant)
    pub serial_device: String,
    pub baud_rate: u32,
    /// How long to wait for a reply to a request
    pub reply_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Udp,
            serial_device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            reply_timeout_ms: 5000,
        }
    }
}

impl LinkConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Loop cadence and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between outer-loop iterations
    pub loop_interval_ms: u64,
    /// Minimum time between data transmissions
    pub data_interval_ms: u64,
    /// Maximum server silence before it counts as an error (0 disables)
    pub sync_interval_ms: u64,
    /// Reply window for diagnostic passthrough commands
    pub diagnostic_timeout_ms: u64,
    /// One-second polls spent waiting for a time source
    pub time_source_polls: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 1000,
            data_interval_ms: 1000,
            sync_interval_ms: 120_000,
            diagnostic_timeout_ms: 2000,
            time_source_polls: 60,
        }
    }
}

impl TimingConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn data_interval(&self) -> Duration {
        Duration::from_millis(self.data_interval_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_ms > 0).then(|| Duration::from_millis(self.sync_interval_ms))
    }

    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostic_timeout_ms)
    }
}

/// Connection health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive errors that trigger a link rebuild
    pub reconnect_threshold: u32,
    /// Consecutive errors that trigger a full re-setup
    pub max_errors: u32,
    /// Consecutive failed speed reads before the vehicle counts as gone
    pub obd_error_budget: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            reconnect_threshold: 3,
            max_errors: 10,
            obd_error_budget: 3,
        }
    }
}

/// Sample cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Buffer capacity in bytes
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: sample_cache::DEFAULT_CAPACITY,
        }
    }
}

/// Which collaborators the build uses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemConfig {
    /// Vehicle bus is mandatory when enabled
    pub vehicle_bus: bool,
    pub position: bool,
    pub motion: bool,
    pub storage: bool,
    pub position_baud: u32,
    /// ELM327 adapter serial port
    pub adapter_device: String,
    pub adapter_baud: u32,
    pub adapter_protocol: ObdProtocol,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            vehicle_bus: true,
            position: true,
            motion: true,
            storage: true,
            position_baud: 115_200,
            adapter_device: "/dev/ttyUSB1".to_string(),
            adapter_baud: 38_400,
            adapter_protocol: ObdProtocol::Auto,
        }
    }
}

/// Sensor polling rotation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Polled every iteration after speed
    pub secondary_pids: Vec<Pid>,
    /// One of these is polled every `low_priority_every` iterations
    pub low_priority_pids: Vec<Pid>,
    pub low_priority_every: u64,
    /// Device temperature and battery voltage period
    pub device_temp_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            secondary_pids: vec![Pid::EngineLoad, Pid::Throttle, Pid::Rpm],
            low_priority_pids: vec![
                Pid::IntakeTemp,
                Pid::CoolantTemp,
                Pid::AmbientTemp,
                Pid::BarometricPressure,
                Pid::EngineFuelRate,
            ],
            low_priority_every: 50,
            device_temp_every: 100,
        }
    }
}

/// Motion sensing and wake-on-motion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Readings averaged into the rest bias
    pub calibration_samples: u32,
    /// Raw accelerometer counts per g
    pub counts_per_g: f32,
    /// Bias-corrected magnitude (g) that wakes the device
    pub wake_threshold_g: f32,
    /// Poll period while waiting for motion in standby
    pub standby_poll_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            calibration_samples: 100,
            counts_per_g: 16_384.0,
            wake_threshold_g: 0.2,
            standby_poll_ms: 100,
        }
    }
}

/// Persistent storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data".to_string(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
