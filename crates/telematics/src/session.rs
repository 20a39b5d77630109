//! Session State Machine
//!
//! Owns readiness, the sample cache, and every collaborator, and drives the
//! setup, login, run, standby lifecycle from a single task. Nothing here is
//! shared across tasks: one outer-loop iteration runs to completion before
//! the next begins.

use crate::clock::DeviceClock;
use crate::command::{
    Command, CommandDispatcher, CommandExecutor, RESULT_INVALID, RESULT_OK, RESULT_TIMEOUT,
};
use crate::config::TelemetryConfig;
use crate::error::{LinkError, SessionError};
use crate::health::{ConnectionHealth, LinkDecision};
use crate::peripherals::Peripherals;
use crate::pipeline::{Pipeline, PollOutcome, Sources};
use crate::readiness::{Readiness, SessionState};
use async_trait::async_trait;
use obd_protocol::{format_dtc, normalize_reply, ObdError};
use sample_cache::{OverflowSink, Sample, SampleCache, SampleKey, SampleValue};
use storage::PersistentStorage;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use wire_protocol::{Ack, Event, LoginPayload, LoginReply, Reply, Request};

/// Most stored trouble codes reported at login
const MAX_DTCS: usize = 6;

/// Most inbound frames handled per iteration
const MAX_INBOUND_PER_CYCLE: usize = 16;

/// Deferred until the command's ACK is on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Restart,
    Standby,
}

/// The telemetry session engine
pub struct Session {
    config: TelemetryConfig,
    peripherals: Peripherals,
    readiness: Readiness,
    state: SessionState,
    cache: SampleCache,
    health: ConnectionHealth,
    dispatcher: CommandDispatcher,
    pipeline: Pipeline,
    clock: DeviceClock,
    feed_id: u16,
    vin: Option<String>,
    dtcs: Vec<String>,
    server_name: Option<String>,
    pending: Option<PendingAction>,
    /// Server pushes that arrived while a request awaited its reply
    deferred: VecDeque<Reply>,
    /// Storage size last queued for upload
    reported_size: u64,
    /// Storage size waiting for a frame that carries samples
    unreported_size: Option<u64>,
}

impl Session {
    pub fn new(config: TelemetryConfig, peripherals: Peripherals) -> Self {
        let cache = SampleCache::new(config.cache.capacity);
        let health = ConnectionHealth::new(&config.timing, &config.health);
        let pipeline = Pipeline::new(
            config.pipeline.clone(),
            config.motion.clone(),
            config.health.obd_error_budget,
        );
        Self {
            config,
            peripherals,
            readiness: Readiness::empty(),
            state: SessionState::Uninitialized,
            cache,
            health,
            dispatcher: CommandDispatcher::new(),
            pipeline,
            clock: DeviceClock::new(),
            feed_id: 0,
            vin: None,
            dtcs: Vec::new(),
            server_name: None,
            pending: None,
            deferred: VecDeque::new(),
            reported_size: 0,
            unreported_size: None,
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn feed_id(&self) -> u16 {
        self.feed_id
    }

    pub fn cache(&self) -> &SampleCache {
        &self.cache
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    fn status(&mut self, text: &str) {
        self.peripherals.status.print(text);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Bring every subsystem up in dependency order
    ///
    /// Motion, storage, and position are optional; the vehicle bus (when
    /// enabled), the network link, and login are not.
    pub async fn setup(&mut self) -> Result<(), SessionError> {
        self.set_state(SessionState::Initializing);
        self.status("Initializing");
        let subsystems = self.config.subsystems.clone();

        if subsystems.motion && !self.readiness.contains(Readiness::MOTION) {
            if let Some(motion) = self.peripherals.motion.as_mut() {
                match motion.init().await {
                    Ok(()) => {
                        self.pipeline.calibrate(motion.as_mut()).await;
                        self.readiness.insert(Readiness::MOTION);
                        info!("Motion sensor ready");
                    }
                    Err(e) => warn!("Motion sensor unavailable: {}", e),
                }
            }
        }

        if subsystems.storage && !self.readiness.contains(Readiness::STORAGE) {
            if let Some(storage) = self.peripherals.storage.as_mut() {
                match storage.init() {
                    Ok(()) => {
                        self.readiness.insert(Readiness::STORAGE);
                        info!("Storage ready");
                    }
                    Err(e) => warn!("Storage unavailable: {}", e),
                }
            }
        }

        if subsystems.vehicle_bus && !self.readiness.contains(Readiness::VEHICLE_BUS) {
            if let Err(e) = self.init_vehicle_bus().await {
                error!("Vehicle bus init failed: {}", e);
                self.status("Vehicle bus error");
                return Err(e);
            }
        }

        if subsystems.position && !self.readiness.contains(Readiness::POSITION) {
            if let Some(gps) = self.peripherals.position.as_mut() {
                match gps.init(subsystems.position_baud).await {
                    Ok(()) => {
                        self.readiness.insert(Readiness::POSITION);
                        info!("Position source ready");
                    }
                    Err(e) => warn!("Position source unavailable: {}", e),
                }
            }
        }

        if !self.readiness.contains(Readiness::NETWORK_LINK) {
            if let Err(e) = self.open_link().await {
                error!("Network link failed: {}", e);
                self.status("Network error");
                return Err(e);
            }
        }

        if !self.readiness.contains(Readiness::SESSION_CONNECTED) {
            if let Err(e) = self.login().await {
                error!("Login failed: {}", e);
                self.status("Login failed");
                return Err(e);
            }
        }

        self.begin_storage().await;

        if self.cache.is_empty() {
            self.cache.open(self.feed_id);
        }
        self.health.reset(Instant::now());
        self.readiness.try_all_go(subsystems.vehicle_bus);
        self.set_state(SessionState::Connected);
        let line = format!("Connected, feed {:X}", self.feed_id);
        self.status(&line);
        Ok(())
    }

    async fn init_vehicle_bus(&mut self) -> Result<(), SessionError> {
        let bus = self
            .peripherals
            .vehicle
            .as_mut()
            .ok_or(SessionError::VehicleBus(ObdError::AdapterNotResponding))?;
        bus.init().await?;

        match bus.read_vin().await {
            Ok(vin) if !vin.is_empty() => {
                info!("VIN: {}", vin);
                self.vin = Some(vin);
            }
            Ok(_) => debug!("Vehicle reported an empty VIN"),
            Err(e) => warn!("VIN unavailable: {}", e),
        }
        match bus.read_dtcs(MAX_DTCS).await {
            Ok(codes) => {
                self.dtcs = codes.into_iter().map(format_dtc).collect();
                if !self.dtcs.is_empty() {
                    info!("Stored trouble codes: {}", self.dtcs.join(" "));
                }
            }
            Err(e) => warn!("Trouble codes unavailable: {}", e),
        }

        self.readiness.insert(Readiness::VEHICLE_BUS);
        self.pipeline.reset_vehicle_errors();
        info!("Vehicle bus ready");
        Ok(())
    }

    async fn open_link(&mut self) -> Result<(), SessionError> {
        let policy = self.config.retry.clone();
        let mut last_error = LinkError::NotOpen;
        for attempt in policy.attempts() {
            let transport = &mut self.peripherals.transport;
            match transport
                .open(&self.config.server.host, self.config.server.port)
                .await
            {
                Ok(()) => {
                    self.readiness.insert(Readiness::NETWORK_LINK);
                    let line = format!("{} link up", transport.device_name());
                    info!("{}", line);
                    self.status(&line);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Link open attempt {}/{} failed: {}", attempt, policy.max_attempts, e);
                    last_error = e;
                }
            }
            policy.pause(attempt).await;
        }
        Err(last_error.into())
    }

    /// Send a request and wait for the reply that echoes its event
    ///
    /// A COMMAND or SYNC the server pushes in the meantime is queued for
    /// [`Session::poll_inbound`] and the wait continues until the deadline.
    async fn request(&mut self, event: Event, payload: &str) -> Result<Reply, SessionError> {
        let frame = Request::new(event, self.clock.uptime_ms())
            .with_server_key(self.config.server.key.as_deref())
            .with_payload(payload)
            .encode();
        self.peripherals.transport.send(&frame).await?;

        let deadline = Instant::now() + self.config.link.reply_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let bytes = self
                .peripherals
                .transport
                .receive(remaining)
                .await
                .ok_or(SessionError::NoReply(event))?;
            match Reply::parse(&bytes) {
                Ok(reply)
                    if reply.event != event
                        && matches!(reply.event, Event::Command | Event::Sync) =>
                {
                    if self.deferred.len() < MAX_INBOUND_PER_CYCLE {
                        debug!("Deferring {} received while awaiting {}", reply.event, event);
                        self.deferred.push_back(reply);
                    } else {
                        warn!("Inbound backlog full, dropping {}", reply.event);
                    }
                }
                _ => return Ok(Reply::expect(&bytes, event)?),
            }
        }
    }

    /// Log in and learn the feed identifier
    ///
    /// On failure the link is closed and both network flags are cleared.
    pub async fn login(&mut self) -> Result<(), SessionError> {
        let payload = LoginPayload {
            device_id: self.config.device_id.clone(),
            vin: self.vin.clone(),
            dtcs: self.dtcs.clone(),
        }
        .encode();
        let policy = self.config.retry.clone();
        let mut last_error = SessionError::NoReply(Event::Login);

        for attempt in policy.attempts() {
            let result = self
                .request(Event::Login, &payload)
                .await
                .and_then(|reply| LoginReply::from_reply(&reply).map_err(SessionError::from));
            match result {
                Ok(login) => {
                    self.feed_id = login.feed_id;
                    if let Some(unix_secs) = login.server_time {
                        self.clock.set_wall_time(unix_secs);
                    }
                    if let Some(name) = &login.server_name {
                        info!("Server: {}", name);
                    }
                    self.server_name = login.server_name;
                    self.readiness.insert(Readiness::SESSION_CONNECTED);
                    self.health.record_sync(Instant::now());
                    info!("Logged in, feed {:X}", self.feed_id);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Login attempt {}/{} failed: {}", attempt, policy.max_attempts, e);
                    last_error = e;
                }
            }
            policy.pause(attempt).await;
        }

        self.peripherals.transport.close().await;
        self.readiness
            .lose(Readiness::NETWORK_LINK | Readiness::SESSION_CONNECTED);
        Err(last_error)
    }

    /// Single LOGOUT attempt; the session is considered closed either way
    pub async fn logout(&mut self) {
        if !self.readiness.contains(Readiness::SESSION_CONNECTED) {
            return;
        }
        match self.request(Event::Logout, "").await {
            Ok(_) => info!("Logged out"),
            Err(e) => debug!("Logout unacknowledged: {}", e),
        }
        self.readiness.lose(Readiness::SESSION_CONNECTED);
    }

    /// Open a dated storage session and start forwarding rotations into it
    async fn begin_storage(&mut self) {
        if !self.readiness.contains(Readiness::STORAGE) {
            return;
        }
        let mut date = self.clock.date().or(self.pipeline.last_date());
        if date.is_none() && self.readiness.contains(Readiness::POSITION) {
            if let Some(gps) = self.peripherals.position.as_mut() {
                info!("Waiting for a time source");
                for _ in 0..self.config.timing.time_source_polls {
                    if let Some(fix) = gps.fix().await.filter(|fix| fix.date != 0) {
                        date = Some(fix.date);
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        let Some(storage) = self.peripherals.storage.as_mut() else {
            return;
        };
        match storage.begin(date.unwrap_or(0)) {
            Ok(()) => {
                self.cache.set_forward(true);
                info!("Storage session open ({} bytes)", storage.size_bytes());
            }
            Err(e) => {
                warn!("Storage session failed: {}", e);
                self.cache.set_forward(false);
            }
        }
    }

    /// Persist unsent samples and close the storage session
    fn close_storage(&mut self) {
        if let Some(storage) = self.peripherals.storage.as_deref_mut() {
            if storage.is_open() {
                if !self.cache.is_empty() {
                    self.cache.seal();
                    if let Err(e) = self.cache.rotate(self.feed_id, Some(&mut *storage)) {
                        warn!("Unsent samples not saved: {}", e);
                    }
                }
                storage.end();
            }
        }
        self.cache.set_forward(false);
    }

    /// Tear down and idle until motion is detected
    pub async fn standby(&mut self) {
        self.set_state(SessionState::Standby);
        self.status("Standby");
        info!("Entering standby");

        self.logout().await;
        self.peripherals.transport.close().await;
        self.readiness.lose(Readiness::NETWORK_LINK);

        self.close_storage();

        if let Some(gps) = self.peripherals.position.as_mut() {
            gps.shutdown().await;
        }
        self.readiness.lose(Readiness::POSITION);

        if !self.readiness.contains(Readiness::VEHICLE_BUS) {
            info!("Trip ended ({} m)", self.pipeline.trip_meters());
            self.feed_id = 0;
            self.pipeline.reset_trip();
        }
        self.readiness.remove(Readiness::ALL_SYSTEMS_GO);

        if self.readiness.contains(Readiness::MOTION) {
            if let Some(motion) = self.peripherals.motion.as_mut() {
                self.pipeline.calibrate(motion.as_mut()).await;
                loop {
                    tokio::time::sleep(self.pipeline.standby_poll()).await;
                    if let Some(reading) = motion.read().await {
                        if self.pipeline.is_moving(&reading) {
                            info!(
                                "Motion detected ({:.2} g)",
                                self.pipeline.motion_magnitude(&reading)
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Close and reopen the link after repeated failures
    async fn rebuild_link(&mut self) {
        warn!("Rebuilding network link");
        self.peripherals.transport.close().await;
        self.readiness.lose(Readiness::NETWORK_LINK);
        match self.open_link().await {
            Ok(()) => {
                self.health.link_rebuilt();
                self.readiness.try_all_go(self.config.subsystems.vehicle_bus);
            }
            Err(e) => {
                error!("Link rebuild failed: {}", e);
                self.set_state(SessionState::Degraded);
                self.status("Network error");
            }
        }
    }

    /// SYNC round-trip after a link rebuild
    async fn resync(&mut self) -> bool {
        let policy = self.config.retry.clone();
        for attempt in policy.attempts() {
            match self.request(Event::Sync, "").await {
                Ok(_) => {
                    self.health.record_sync(Instant::now());
                    debug!("Resynced with server");
                    return true;
                }
                Err(e) => warn!("Sync attempt {}/{} failed: {}", attempt, policy.max_attempts, e),
            }
            policy.pause(attempt).await;
        }
        false
    }

    /// Give up on the current session; the next iteration re-runs setup
    async fn degrade(&mut self) {
        error!(
            "Connection errors reached {}, restarting session",
            self.health.errors()
        );
        self.set_state(SessionState::Degraded);
        self.status("Connection lost");
        self.logout().await;
        self.peripherals.transport.close().await;
        self.readiness
            .lose(Readiness::NETWORK_LINK | Readiness::SESSION_CONNECTED);
    }

    /// Seal the cache and send it
    async fn transmit(&mut self) {
        let len = self.cache.seal();
        match self.peripherals.transport.send(self.cache.as_bytes()).await {
            Ok(()) => {
                debug!("Sent {} bytes ({} samples)", len, self.cache.sample_count());
                metrics::counter!("telemetry_frames_sent_total").increment(1);
                self.health.record_success(Instant::now());

                let storage = self
                    .peripherals
                    .storage
                    .as_deref_mut()
                    .filter(|_| self.readiness.contains(Readiness::STORAGE));
                let persisted = match self.cache.rotate(self.feed_id, storage) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Storage write failed: {}", e);
                        false
                    }
                };
                if persisted && self.cache.is_forwarding() {
                    if let Some(storage) = self.peripherals.storage.as_ref() {
                        let size = storage.size_bytes();
                        debug!("{} bytes saved", size);
                        if size != self.reported_size {
                            self.unreported_size = Some(size);
                        }
                    }
                }
            }
            Err(e) => {
                self.cache.unseal();
                warn!("Send failed: {}", e);
                if self.health.record_failure() {
                    self.rebuild_link().await;
                }
            }
        }
    }

    /// Piggy-back a changed storage size on a frame that already has samples
    fn report_data_size(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        if let Some(size) = self.unreported_size.take() {
            let appended = self.cache.append(&Sample::new(
                SampleKey::DATA_SIZE,
                SampleValue::Int(size.min(i32::MAX as u64) as i32),
                self.clock.sample_ts(),
            ));
            if appended {
                self.reported_size = size;
            } else {
                self.unreported_size = Some(size);
            }
        }
    }

    /// Resync if a rebuild asked for it, then transmit when due
    async fn service_link(&mut self) {
        if self.health.take_resync() && !self.resync().await {
            warn!("Resync after link rebuild failed");
        }
        match self.health.decide(Instant::now(), !self.cache.is_empty()) {
            LinkDecision::Idle | LinkDecision::SyncOverdue => {}
            LinkDecision::Transmit => self.transmit().await,
        }
    }

    /// Handle frames the server pushed since the last iteration
    pub async fn poll_inbound(&mut self) {
        for _ in 0..MAX_INBOUND_PER_CYCLE {
            let reply = match self.deferred.pop_front() {
                Some(reply) => reply,
                None => {
                    let Some(bytes) = self.peripherals.transport.receive(Duration::ZERO).await
                    else {
                        break;
                    };
                    match Reply::parse(&bytes) {
                        Ok(reply) => reply,
                        Err(e) => {
                            debug!("Dropping inbound frame: {}", e);
                            continue;
                        }
                    }
                }
            };
            match reply.event {
                Event::Command => {
                    if let Some(ack) = self.handle_command(&reply).await {
                        info!("Command token {} handled: {}", ack.token, ack.encode());
                    }
                    if self.pending.is_some() {
                        self.apply_pending().await;
                        break;
                    }
                }
                Event::Sync => {
                    debug!("Sync from server");
                    self.health.record_sync(Instant::now());
                }
                other => debug!("Ignoring unsolicited {}", other),
            }
        }
    }

    async fn handle_command(&mut self, reply: &Reply) -> Option<Ack> {
        let mut executor = DeviceCommands {
            peripherals: &mut self.peripherals,
            vehicle_ready: self.readiness.contains(Readiness::VEHICLE_BUS),
            clock: &self.clock,
            vin: self.vin.as_deref(),
            diagnostic_timeout: self.config.timing.diagnostic_timeout(),
            pending: &mut self.pending,
        };
        let ack = self.dispatcher.process_reply(reply, &mut executor).await?;
        self.send_ack(&ack).await;
        Some(ack)
    }

    /// Fire-and-forget ACK, retried only when the send itself fails
    async fn send_ack(&mut self, ack: &Ack) {
        let frame = Request::new(Event::Ack, self.clock.uptime_ms())
            .with_server_key(self.config.server.key.as_deref())
            .with_payload(ack.encode())
            .encode();
        let policy = self.config.retry.clone();
        for attempt in policy.attempts() {
            match self.peripherals.transport.send(&frame).await {
                Ok(()) => return,
                Err(e) => warn!("ACK send attempt {}/{} failed: {}", attempt, policy.max_attempts, e),
            }
            policy.pause(attempt).await;
        }
        warn!("ACK for token {} not delivered", ack.token);
    }

    async fn apply_pending(&mut self) {
        match self.pending.take() {
            Some(PendingAction::Restart) => self.restart().await,
            Some(PendingAction::Standby) => self.standby().await,
            None => {}
        }
    }

    /// Flush storage, restart the board, and start over from scratch
    async fn restart(&mut self) {
        info!("Restarting device");
        self.status("Restarting");
        self.close_storage();
        self.peripherals.transport.close().await;
        if let Some(bus) = self.peripherals.vehicle.as_mut() {
            bus.shutdown().await;
        }
        self.peripherals.board.restart().await;

        self.readiness = Readiness::empty();
        self.set_state(SessionState::Uninitialized);
        self.cache = SampleCache::new(self.config.cache.capacity);
        self.deferred.clear();
        self.feed_id = 0;
        self.pipeline.reset_trip();
    }

    /// Execute a line from the local console; no token, no ACK
    pub async fn console_command(&mut self, line: &str) -> String {
        let command = Command::parse(line);
        let mut executor = DeviceCommands {
            peripherals: &mut self.peripherals,
            vehicle_ready: self.readiness.contains(Readiness::VEHICLE_BUS),
            clock: &self.clock,
            vin: self.vin.as_deref(),
            diagnostic_timeout: self.config.timing.diagnostic_timeout(),
            pending: &mut self.pending,
        };
        let result = executor.execute(command).await;
        let line = format!("{} -> {}", line.trim(), result);
        self.status(&line);
        self.apply_pending().await;
        result
    }

    async fn bring_up(&mut self) -> Result<(), SessionError> {
        let policy = self.config.setup_retry.clone();
        for attempt in policy.attempts() {
            match self.setup().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Setup attempt {}/{} failed: {}", attempt, policy.max_attempts, e);
                    self.standby().await;
                }
            }
            policy.pause(attempt).await;
        }
        Err(SessionError::SetupExhausted(policy.max_attempts))
    }

    async fn poll(&mut self) -> PollOutcome {
        let sources = Sources {
            vehicle: self.peripherals.vehicle.as_mut(),
            position: self.peripherals.position.as_mut(),
            motion: self.peripherals.motion.as_mut(),
            board: &mut self.peripherals.board,
        };
        self.pipeline
            .poll(sources, &mut self.readiness, &mut self.cache, &self.clock)
            .await
    }

    /// One outer-loop iteration: poll, transmit, handle inbound, escalate
    pub async fn run_once(&mut self) -> Result<(), SessionError> {
        if !self.readiness.all_go() {
            self.bring_up().await?;
        }

        let outcome = self.poll().await;
        self.report_data_size();
        self.service_link().await;
        self.poll_inbound().await;

        if self.health.exhausted() {
            self.degrade().await;
            return Ok(());
        }
        if outcome.vehicle_disconnected {
            self.status("Vehicle disconnected");
            self.standby().await;
        }
        Ok(())
    }

    /// Run until `shutdown` fires, executing console lines between iterations
    pub async fn run(
        &mut self,
        mut console: mpsc::Receiver<String>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!("Telemetry session starting");
        loop {
            if let Err(e) = self.run_once().await {
                error!("{}", e);
                self.status("Setup failed");
            }
            while let Ok(line) = console.try_recv() {
                let result = self.console_command(&line).await;
                debug!("Console: {} -> {}", line.trim(), result);
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.timing.loop_interval()) => {}
            }
        }
        self.shutdown().await;
    }

    /// Log out and flush everything before power-off
    pub async fn shutdown(&mut self) {
        info!("Telemetry session stopping");
        self.logout().await;
        self.peripherals.transport.close().await;
        self.close_storage();
        self.readiness = Readiness::empty();
        self.set_state(SessionState::Uninitialized);
    }
}

/// Command executor over the session's collaborators
struct DeviceCommands<'a> {
    peripherals: &'a mut Peripherals,
    vehicle_ready: bool,
    clock: &'a DeviceClock,
    vin: Option<&'a str>,
    diagnostic_timeout: Duration,
    pending: &'a mut Option<PendingAction>,
}

#[async_trait]
impl CommandExecutor for DeviceCommands<'_> {
    async fn execute(&mut self, command: Command) -> String {
        match command {
            Command::SetIndicator(mode) => {
                self.peripherals.board.set_indicator(mode);
                RESULT_OK.to_string()
            }
            Command::Restart => {
                *self.pending = Some(PendingAction::Restart);
                RESULT_OK.to_string()
            }
            Command::Standby => {
                *self.pending = Some(PendingAction::Standby);
                RESULT_OK.to_string()
            }
            Command::Diagnostic(request) => {
                let timeout = self.diagnostic_timeout;
                if !self.vehicle_ready {
                    return RESULT_TIMEOUT.to_string();
                }
                let Some(bus) = self.peripherals.vehicle.as_mut() else {
                    return RESULT_TIMEOUT.to_string();
                };
                match tokio::time::timeout(timeout, bus.request(&request, timeout)).await {
                    Ok(Ok(reply)) => {
                        let text = normalize_reply(&reply);
                        if text.is_empty() {
                            RESULT_TIMEOUT.to_string()
                        } else {
                            text
                        }
                    }
                    Ok(Err(e)) => {
                        debug!("Diagnostic request failed: {}", e);
                        RESULT_TIMEOUT.to_string()
                    }
                    Err(_) => RESULT_TIMEOUT.to_string(),
                }
            }
            Command::Vin => self.vin.unwrap_or("N/A").to_string(),
            Command::Uptime => self.clock.uptime_secs().to_string(),
            Command::Unknown(text) => {
                debug!("Unknown command: {}", text);
                RESULT_INVALID.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::testing::{
        sealed, BoardLog, LinkLog, MockBoard, MockBus, MockMotion, MockPosition, MockStatus,
        MockTransport,
    };
    use std::sync::{Arc, Mutex};
    use storage::{MemoryLog, MemoryStorage};

    struct Harness {
        session: Session,
        link: Arc<Mutex<LinkLog>>,
        board: Arc<Mutex<BoardLog>>,
        status: Arc<Mutex<Vec<String>>>,
        storage: Option<Arc<Mutex<MemoryLog>>>,
    }

    fn test_config() -> TelemetryConfig {
        let mut config = TelemetryConfig::default();
        config.subsystems.position = false;
        config.subsystems.motion = false;
        config.subsystems.storage = false;
        config.timing.data_interval_ms = 2000;
        config.timing.sync_interval_ms = 0;
        config.pipeline = PipelineConfig {
            secondary_pids: Vec::new(),
            low_priority_pids: Vec::new(),
            ..PipelineConfig::default()
        };
        config
    }

    fn harness(config: TelemetryConfig, bus: MockBus, storage: Option<MemoryStorage>) -> Harness {
        let transport = MockTransport::new();
        let board = MockBoard::default();
        let status = MockStatus::default();
        let handles = (
            transport.handle(),
            board.handle(),
            status.handle(),
            storage.as_ref().map(MemoryStorage::handle),
        );
        let peripherals = Peripherals {
            transport: Box::new(transport),
            vehicle: Some(Box::new(bus)),
            position: None,
            motion: None,
            storage: storage.map(|s| Box::new(s) as Box<dyn PersistentStorage>),
            board: Box::new(board),
            status: Box::new(status),
        };
        Harness {
            session: Session::new(config, peripherals),
            link: handles.0,
            board: handles.1,
            status: handles.2,
            storage: handles.3,
        }
    }

    async fn step(session: &mut Session) {
        session.run_once().await.unwrap();
        tokio::time::advance(Duration::from_millis(1000)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_sets_all_systems_go() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();

        let readiness = h.session.readiness();
        assert!(readiness.all_go());
        assert!(readiness.contains(Readiness::VEHICLE_BUS | Readiness::NETWORK_LINK));
        assert!(!readiness.contains(Readiness::POSITION));
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.session.feed_id(), 26);
        assert_eq!(h.session.server_name(), Some("mock"));

        let link = h.link.lock().unwrap();
        let login = link.sent_events(1);
        assert_eq!(login.len(), 1);
        assert!(login[0].contains(",ID=TELEMATICS-0001,VIN=WDB2030461A000001,DTC=P0123*"));
        assert!(h.status.lock().unwrap().contains(&"Connected, feed 1A".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vehicle_bus_failure_is_fatal() {
        let mut h = harness(test_config(), MockBus::new().unavailable(), None);
        let err = h.session.setup().await.unwrap_err();
        assert!(matches!(err, SessionError::VehicleBus(_)));
        assert!(!h.session.readiness().contains(Readiness::NETWORK_LINK));
        assert_eq!(h.link.lock().unwrap().opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_iterations_one_frame() {
        let mut h = harness(test_config(), MockBus::new(), None);
        for _ in 0..3 {
            step(&mut h.session).await;
        }

        let link = h.link.lock().unwrap();
        let frames = link.data_frames();
        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_str();
        assert!(frame.starts_with("1A#"));
        assert!(wire_protocol::verify(frame.as_bytes()).is_ok());

        let body = frame.split_once('*').unwrap().0;
        let speeds: Vec<&str> = body
            .trim_start_matches("1A#")
            .split(',')
            .filter(|sample| sample.starts_with("10D="))
            .collect();
        assert_eq!(speeds, vec!["10D=40", "10D=42", "10D=44"]);
        assert!(h.session.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_login_fails_after_three_attempts() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.link.lock().unwrap().corrupt_login = true;

        let err = h.session.login_after_link().await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));

        let readiness = h.session.readiness();
        assert!(!readiness.contains(Readiness::NETWORK_LINK));
        assert!(!readiness.contains(Readiness::SESSION_CONNECTED));
        assert_eq!(h.link.lock().unwrap().sent_events(1).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_executes_once_and_acks() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();

        let command = sealed("EV=3,TK=5,CMD=LED=2");
        h.link.lock().unwrap().inbound.push_back(command.clone());
        h.session.poll_inbound().await;
        h.link.lock().unwrap().inbound.push_back(command);
        h.session.poll_inbound().await;

        assert_eq!(h.board.lock().unwrap().indicator, vec![2]);
        let link = h.link.lock().unwrap();
        let acks = link.sent_events(5);
        assert_eq!(acks.len(), 2);
        assert!(acks[0].contains(",TK=5,MSG=OK*"));
        assert!(acks[1].contains(",TK=5,DUP=1*"));
        for ack in acks {
            assert!(wire_protocol::verify(ack.as_bytes()).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_during_logout_is_handled_later() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();

        // the server pushes a command just before it answers LOGOUT
        h.link
            .lock()
            .unwrap()
            .inbound
            .push_back(sealed("EV=3,TK=5,CMD=LED=2"));
        h.session.logout().await;
        assert!(h.board.lock().unwrap().indicator.is_empty());
        assert!(h.link.lock().unwrap().inbound.is_empty());

        h.session.poll_inbound().await;
        assert_eq!(h.board.lock().unwrap().indicator, vec![2]);
        let link = h.link.lock().unwrap();
        let acks = link.sent_events(5);
        assert_eq!(acks.len(), 1);
        assert!(acks[0].contains(",TK=5,MSG=OK*"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_push_during_login_keeps_waiting() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.link.lock().unwrap().inbound.push_back(sealed("EV=4"));
        h.session.setup().await.unwrap();
        assert_eq!(h.session.feed_id(), 26);
        assert_eq!(h.link.lock().unwrap().sent_events(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_open_gives_up_after_three_attempts() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.link.lock().unwrap().fail_open = true;

        let err = h.session.setup().await.unwrap_err();
        assert!(matches!(err, SessionError::Link(LinkError::Open(_, _))));
        assert_eq!(h.link.lock().unwrap().opens, 3);
        let readiness = h.session.readiness();
        assert!(readiness.contains(Readiness::VEHICLE_BUS));
        assert!(!readiness.contains(Readiness::NETWORK_LINK));
        assert!(h.link.lock().unwrap().sent_events(1).is_empty());
        assert!(h.status.lock().unwrap().contains(&"Network error".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_exhausted_after_standby_between_attempts() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.link.lock().unwrap().fail_open = true;

        let err = h.session.run_once().await.unwrap_err();
        assert!(matches!(err, SessionError::SetupExhausted(3)));
        assert_eq!(h.session.state(), SessionState::Standby);
        let link = h.link.lock().unwrap();
        assert_eq!(link.opens, 9);
        assert!(link.closes >= 3, "standby after every failed setup");
        let standbys = h
            .status
            .lock()
            .unwrap()
            .iter()
            .filter(|line| *line == "Standby")
            .count();
        assert_eq!(standbys, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_send_retried_three_times() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();
        {
            let mut link = h.link.lock().unwrap();
            link.fail_send = true;
            link.inbound.push_back(sealed("EV=3,TK=8,CMD=LED=2"));
        }
        h.session.poll_inbound().await;

        assert_eq!(h.board.lock().unwrap().indicator, vec![2]);
        let link = h.link.lock().unwrap();
        let attempts = link.sent_events(5);
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|ack| ack.contains(",TK=8,MSG=OK*")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_source_wait_is_capped() {
        let mut config = test_config();
        config.subsystems.storage = true;
        config.subsystems.position = true;
        config.timing.time_source_polls = 5;
        let mut h = harness(config, MockBus::new(), Some(MemoryStorage::new()));
        h.session.peripherals.position = Some(Box::new(MockPosition::no_fix()));
        h.link.lock().unwrap().server_time = None;

        let start = Instant::now();
        h.session.setup().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(5100));

        assert!(h.session.readiness().all_go());
        assert!(h.session.cache().is_forwarding());
        let log = h.storage.as_ref().unwrap().lock().unwrap();
        assert_eq!(log.sessions.len(), 1);
        assert_eq!(log.sessions[0].0, "UNDATED.TXT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_command_is_not_acked() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();

        let mut command = sealed("EV=3,TK=7,CMD=LED=1");
        command[0] = b'X';
        h.link.lock().unwrap().inbound.push_back(command);
        h.session.poll_inbound().await;

        assert!(h.board.lock().unwrap().indicator.is_empty());
        assert!(h.link.lock().unwrap().sent_events(5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostic_passthrough_and_timeout() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();
        assert_eq!(h.session.console_command("OBD=010C").await, "41 0C 1A 2B");

        let mut h = harness(test_config(), MockBus::new().silent(), None);
        h.session.setup().await.unwrap();
        assert_eq!(h.session.console_command("OBD=010C").await, RESULT_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_vocabulary() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();
        assert_eq!(h.session.console_command("VIN\n").await, "WDB2030461A000001");
        assert_eq!(h.session.console_command("FLY").await, RESULT_INVALID);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(h.session.console_command("UPTIME").await, "5");
        assert!(h
            .status
            .lock()
            .unwrap()
            .contains(&"FLY -> INVALID".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sends_rebuild_link_once() {
        let mut h = harness(test_config(), MockBus::new(), None);
        h.session.setup().await.unwrap();
        h.link.lock().unwrap().fail_send = true;

        // Transmissions fall due every iteration once the interval has passed
        tokio::time::advance(Duration::from_millis(2000)).await;
        for _ in 0..3 {
            step(&mut h.session).await;
        }
        assert_eq!(h.session.health().errors(), 3);
        assert_eq!(h.link.lock().unwrap().opens, 2);
        assert!(!h.session.cache().is_empty());

        h.link.lock().unwrap().fail_send = false;
        step(&mut h.session).await;
        assert_eq!(h.session.health().errors(), 0);
        assert_eq!(h.link.lock().unwrap().opens, 2);
        // the frame that finally went out kept every sample from the failed cycles
        let link = h.link.lock().unwrap();
        let delivered = link.data_frames().last().copied().unwrap();
        assert_eq!(delivered.matches("10D=").count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vehicle_loss_ends_trip() {
        let mut h = harness(test_config(), MockBus::new().failing_speed(3), None);
        for _ in 0..3 {
            step(&mut h.session).await;
        }
        assert_eq!(h.session.state(), SessionState::Standby);
        assert_eq!(h.session.feed_id(), 0);
        assert!(!h.session.readiness().contains(Readiness::VEHICLE_BUS));
        assert_eq!(h.link.lock().unwrap().sent_events(2).len(), 1);

        // the bus answers again on the next setup
        step(&mut h.session).await;
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.session.feed_id(), 26);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotations_forward_into_storage() {
        let mut config = test_config();
        config.subsystems.storage = true;
        let mut h = harness(config, MockBus::new(), Some(MemoryStorage::new()));
        for _ in 0..3 {
            step(&mut h.session).await;
        }
        // the persisted size never goes out on its own
        assert!(h.session.cache().is_empty());

        let storage = h.storage.clone().unwrap();
        {
            let log = storage.lock().unwrap();
            assert_eq!(log.sessions.len(), 1);
            assert_eq!(log.sessions[0].0, "141123.TXT");
            let saved = String::from_utf8(log.sessions[0].1.clone()).unwrap();
            assert!(saved.starts_with("1A#"));
            assert!(saved.ends_with('\n'));
        }
        // it rides along with the next sample
        step(&mut h.session).await;
        let pending = String::from_utf8(h.session.cache().as_bytes().to_vec()).unwrap();
        assert!(pending.contains(",10D=46"));
        assert_eq!(pending.matches(",80=").count(), 1);

        h.session.standby().await;
        let log = storage.lock().unwrap();
        assert!(!log.open);
        assert_eq!(log.end_calls, 1);
        let saved = String::from_utf8(log.sessions[0].1.clone()).unwrap();
        assert_eq!(saved.lines().count(), 2, "unsent samples persisted on standby");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_flushes_storage_before_restart() {
        let mut config = test_config();
        config.subsystems.storage = true;
        let mut h = harness(config, MockBus::new(), Some(MemoryStorage::new()));
        h.session.setup().await.unwrap();

        h.link
            .lock()
            .unwrap()
            .inbound
            .push_back(sealed("EV=3,TK=1,CMD=REBOOT"));
        h.session.poll_inbound().await;

        assert_eq!(h.board.lock().unwrap().restarts, 1);
        assert_eq!(h.storage.as_ref().unwrap().lock().unwrap().end_calls, 1);
        assert_eq!(h.link.lock().unwrap().sent_events(5).len(), 1);
        assert_eq!(h.session.state(), SessionState::Uninitialized);
        assert!(h.session.readiness().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_waits_for_motion() {
        let mut config = test_config();
        config.subsystems.motion = true;
        config.motion.calibration_samples = 10;
        let mut h = harness(config, MockBus::new(), None);
        h.session.peripherals.motion =
            Some(Box::new(MockMotion::at_rest([0, 0, 16_384]).moving_after(25)));
        h.session.setup().await.unwrap();
        assert!(h.session.readiness().contains(Readiness::MOTION));

        let start = Instant::now();
        h.session.console_command("STANDBY").await;
        assert_eq!(h.session.state(), SessionState::Standby);
        assert!(!h.session.readiness().all_go());
        // 10 setup + 10 standby calibration reads, wake on the sixth poll
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert!(start.elapsed() < Duration::from_millis(610));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_escalates_to_resetup() {
        let mut config = test_config();
        config.timing.sync_interval_ms = 5000;
        config.health.max_errors = 3;
        let mut h = harness(config, MockBus::new(), None);
        h.session.setup().await.unwrap();
        h.link.lock().unwrap().auto_reply = false;

        tokio::time::advance(Duration::from_millis(5001)).await;
        for _ in 0..3 {
            step(&mut h.session).await;
        }
        assert_eq!(h.session.state(), SessionState::Degraded);
        assert!(!h.session.readiness().contains(Readiness::SESSION_CONNECTED));
        assert!(h.link.lock().unwrap().data_frames().is_empty());
    }

    impl Session {
        /// Open the link and log in, as setup does
        async fn login_after_link(&mut self) -> Result<(), SessionError> {
            self.open_link().await?;
            self.login().await
        }
    }
}
