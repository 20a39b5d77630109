//! Connection health monitor
//!
//! Tracks consecutive failed send cycles and server silence, and tells the
//! session when to transmit, rebuild the link, or give up and re-setup.

use crate::config::{HealthConfig, TimingConfig};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What the link should do this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDecision {
    /// Nothing due yet
    Idle,
    /// Server silent past the sync interval; counted as an error, no send
    SyncOverdue,
    /// Send interval elapsed and the cache has samples
    Transmit,
}

/// Error counters and timers for the server link
#[derive(Debug)]
pub struct ConnectionHealth {
    data_interval: Duration,
    sync_interval: Option<Duration>,
    reconnect_threshold: u32,
    max_errors: u32,
    errors: u32,
    last_sent: Instant,
    last_sync: Instant,
    resync_pending: bool,
}

impl ConnectionHealth {
    pub fn new(timing: &TimingConfig, health: &HealthConfig) -> Self {
        let now = Instant::now();
        Self {
            data_interval: timing.data_interval(),
            sync_interval: timing.sync_interval(),
            reconnect_threshold: health.reconnect_threshold,
            max_errors: health.max_errors,
            errors: 0,
            last_sent: now,
            last_sync: now,
            resync_pending: false,
        }
    }

    /// Start counting from a fresh session
    pub fn reset(&mut self, now: Instant) {
        self.errors = 0;
        self.last_sent = now;
        self.last_sync = now;
        self.resync_pending = false;
    }

    pub fn decide(&mut self, now: Instant, has_samples: bool) -> LinkDecision {
        if let Some(interval) = self.sync_interval {
            if now.duration_since(self.last_sync) > interval {
                self.errors += 1;
                warn!(
                    "No sync from server for {:?} (errors: {})",
                    now.duration_since(self.last_sync),
                    self.errors
                );
                return LinkDecision::SyncOverdue;
            }
        }
        if has_samples && now.duration_since(self.last_sent) >= self.data_interval {
            return LinkDecision::Transmit;
        }
        LinkDecision::Idle
    }

    pub fn record_success(&mut self, now: Instant) {
        if self.errors > 0 {
            debug!("Link recovered after {} errors", self.errors);
        }
        self.errors = 0;
        self.last_sent = now;
    }

    /// Count a failed cycle; `true` when the link should be rebuilt
    pub fn record_failure(&mut self) -> bool {
        self.errors += 1;
        metrics::counter!("telemetry_send_failures_total").increment(1);
        self.errors >= self.reconnect_threshold
    }

    /// A SYNC was observed from the server
    pub fn record_sync(&mut self, now: Instant) {
        self.last_sync = now;
        self.errors = 0;
    }

    /// The link was rebuilt; resync on the next cycle
    pub fn link_rebuilt(&mut self) {
        self.resync_pending = true;
        metrics::counter!("telemetry_link_rebuilds_total").increment(1);
    }

    pub fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.resync_pending)
    }

    /// Errors reached the level that calls for a full re-setup
    pub fn exhausted(&self) -> bool {
        self.errors >= self.max_errors
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }
}
