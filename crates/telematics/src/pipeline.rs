//! Sensor Aggregation Pipeline
//!
//! Polls the vehicle bus, position source, and motion sensor once per loop
//! iteration and writes the readings into the sample cache.

use crate::clock::DeviceClock;
use crate::config::{MotionConfig, PipelineConfig};
use crate::peripherals::{Board, MotionReading, MotionSource, PositionSource};
use crate::readiness::Readiness;
use obd_protocol::{Pid, VehicleBus};
use sample_cache::{Sample, SampleCache, SampleKey, SampleValue};
use tracing::{debug, info, warn};

/// Collaborators polled by one iteration
pub struct Sources<'a> {
    pub vehicle: Option<&'a mut Box<dyn VehicleBus>>,
    pub position: Option<&'a mut Box<dyn PositionSource>>,
    pub motion: Option<&'a mut Box<dyn MotionSource>>,
    pub board: &'a mut Box<dyn Board>,
}

/// What one iteration produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Samples accepted by the cache
    pub samples: usize,
    /// Speed reads failed past the error budget; vehicle-bus readiness dropped
    pub vehicle_disconnected: bool,
}

/// Trip distance from consecutive speed readings (trapezoid rule)
#[derive(Debug, Clone, Default)]
pub struct TripOdometer {
    last: Option<(u64, i32)>,
    meters: f64,
}

impl TripOdometer {
    /// Add a speed reading (km/h) taken at `uptime_ms`
    pub fn update(&mut self, speed_kmh: i32, uptime_ms: u64) {
        let speed = speed_kmh.max(0);
        if let Some((last_ms, last_speed)) = self.last {
            let elapsed = uptime_ms.saturating_sub(last_ms) as f64;
            // km/h * ms / 3600 = m
            self.meters += (last_speed + speed) as f64 / 2.0 * elapsed / 3600.0;
        }
        self.last = Some((uptime_ms, speed));
    }

    pub fn meters(&self) -> u32 {
        self.meters as u32
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-iteration polling state
pub struct Pipeline {
    config: PipelineConfig,
    motion: MotionConfig,
    obd_error_budget: u32,
    iteration: u64,
    low_priority_index: usize,
    obd_errors: u32,
    trip: TripOdometer,
    last_distance: Option<u32>,
    last_fix_time: Option<u32>,
    last_date: Option<u32>,
    bias: [i32; 3],
}

impl Pipeline {
    pub fn new(config: PipelineConfig, motion: MotionConfig, obd_error_budget: u32) -> Self {
        Self {
            config,
            motion,
            obd_error_budget,
            iteration: 0,
            low_priority_index: 0,
            obd_errors: 0,
            trip: TripOdometer::default(),
            last_distance: None,
            last_fix_time: None,
            last_date: None,
            bias: [0; 3],
        }
    }

    /// Run one iteration
    pub async fn poll(
        &mut self,
        sources: Sources<'_>,
        readiness: &mut Readiness,
        cache: &mut SampleCache,
        clock: &DeviceClock,
    ) -> PollOutcome {
        self.iteration += 1;
        let ts = clock.sample_ts();
        let mut outcome = PollOutcome::default();
        let mut log = |cache: &mut SampleCache, key: SampleKey, value: SampleValue| {
            if cache.append(&Sample::new(key, value, ts)) {
                outcome.samples += 1;
            }
        };

        let Sources {
            vehicle,
            position,
            motion,
            board,
        } = sources;
        let mut vehicle = vehicle.filter(|_| readiness.contains(Readiness::VEHICLE_BUS));

        if self.iteration % self.config.device_temp_every == 0 {
            if let Some(temp) = board.temperature() {
                log(cache, SampleKey::DEVICE_TEMP, SampleValue::Int(temp));
            }
            if let Some(bus) = vehicle.as_mut() {
                match bus.battery_voltage().await {
                    Ok(volts) => {
                        let centi = (volts * 100.0).round() as i32;
                        log(cache, SampleKey::BATTERY_VOLTAGE, SampleValue::Centi(centi));
                    }
                    Err(e) => debug!("Battery voltage unavailable: {}", e),
                }
            }
        }

        if let Some(bus) = vehicle {
            match bus.read_parameter(Pid::Speed).await {
                Ok(speed) => {
                    self.obd_errors = 0;
                    log(cache, SampleKey::vehicle(Pid::Speed.as_hex()), SampleValue::Int(speed));
                    self.trip.update(speed, clock.uptime_ms());
                    let meters = self.trip.meters();
                    if self.last_distance != Some(meters) {
                        log(cache, SampleKey::TRIP_DISTANCE, SampleValue::Int(meters as i32));
                        self.last_distance = Some(meters);
                    }

                    for &pid in &self.config.secondary_pids {
                        match bus.read_parameter(pid).await {
                            Ok(value) => log(cache, SampleKey::vehicle(pid.as_hex()), SampleValue::Int(value)),
                            Err(e) => debug!("PID {:02X} read failed: {}", pid.as_hex(), e),
                        }
                    }

                    if self.iteration % self.config.low_priority_every == 0
                        && !self.config.low_priority_pids.is_empty()
                    {
                        let pid = self.config.low_priority_pids
                            [self.low_priority_index % self.config.low_priority_pids.len()];
                        self.low_priority_index = self.low_priority_index.wrapping_add(1);
                        match bus.read_parameter(pid).await {
                            Ok(value) => log(cache, SampleKey::vehicle(pid.as_hex()), SampleValue::Int(value)),
                            Err(e) => debug!("PID {:02X} read failed: {}", pid.as_hex(), e),
                        }
                    }
                }
                Err(e) => {
                    self.obd_errors += 1;
                    warn!(
                        "Speed read failed ({}/{}): {}",
                        self.obd_errors, self.obd_error_budget, e
                    );
                    if self.obd_errors >= self.obd_error_budget {
                        warn!("Vehicle bus error budget exceeded, vehicle disconnected");
                        readiness.lose(Readiness::VEHICLE_BUS);
                        outcome.vehicle_disconnected = true;
                    }
                }
            }
        }

        if let Some(gps) = position.filter(|_| readiness.contains(Readiness::POSITION)) {
            if let Some(fix) = gps.fix().await {
                if self.last_fix_time != Some(fix.time) {
                    self.last_fix_time = Some(fix.time);
                    log(cache, SampleKey::GPS_TIME, SampleValue::Int(fix.time as i32));
                    log(cache, SampleKey::LATITUDE, SampleValue::Coordinate(fix.lat));
                    log(cache, SampleKey::LONGITUDE, SampleValue::Coordinate(fix.lng));
                    log(cache, SampleKey::ALTITUDE, SampleValue::Int(fix.alt));
                    log(cache, SampleKey::GPS_SPEED, SampleValue::Int(fix.speed));
                    log(cache, SampleKey::HEADING, SampleValue::Int(fix.heading));
                    log(cache, SampleKey::SAT_COUNT, SampleValue::Int(fix.sat_count as i32));
                    if fix.date != 0 && self.last_date != Some(fix.date) {
                        self.last_date = Some(fix.date);
                        log(cache, SampleKey::GPS_DATE, SampleValue::Int(fix.date as i32));
                    }
                }
            }
        }

        if let Some(sensor) = motion.filter(|_| readiness.contains(Readiness::MOTION)) {
            if let Some(reading) = sensor.read().await {
                let [x, y, z] = self.scaled_acceleration(&reading);
                log(cache, SampleKey::ACCELEROMETER, SampleValue::Triple(x, y, z));
                if let Some([gx, gy, gz]) = reading.gyro {
                    log(cache, SampleKey::GYROSCOPE, SampleValue::Triple(gx, gy, gz));
                }
                if let Some(temp) = reading.temperature {
                    log(cache, SampleKey::MOTION_TEMP, SampleValue::Int(temp));
                }
            }
        }

        outcome
    }

    /// Average readings at rest into the accelerometer bias
    pub async fn calibrate(&mut self, sensor: &mut dyn MotionSource) {
        let mut sum = [0i64; 3];
        let mut count = 0i64;
        for _ in 0..self.motion.calibration_samples {
            if let Some(reading) = sensor.read().await {
                for (total, axis) in sum.iter_mut().zip(reading.acc) {
                    *total += axis as i64;
                }
                count += 1;
            }
        }
        if count == 0 {
            warn!("Motion calibration got no readings, keeping previous bias");
            return;
        }
        self.bias = sum.map(|total| (total / count) as i32);
        info!("Motion bias calibrated: {:?}", self.bias);
    }

    /// Bias-corrected acceleration in hundredths of a g
    pub fn scaled_acceleration(&self, reading: &MotionReading) -> [i32; 3] {
        let mut out = [0; 3];
        for (axis, value) in out.iter_mut().enumerate() {
            let delta = (reading.acc[axis] - self.bias[axis]) as f32;
            *value = (delta * 100.0 / self.motion.counts_per_g).round() as i32;
        }
        out
    }

    /// Bias-corrected acceleration magnitude in g
    pub fn motion_magnitude(&self, reading: &MotionReading) -> f32 {
        let sum: f32 = (0..3)
            .map(|axis| {
                let delta = (reading.acc[axis] - self.bias[axis]) as f32 / self.motion.counts_per_g;
                delta * delta
            })
            .sum();
        sum.sqrt()
    }

    /// Whether `reading` exceeds the wake-on-motion threshold
    pub fn is_moving(&self, reading: &MotionReading) -> bool {
        self.motion_magnitude(reading) > self.motion.wake_threshold_g
    }

    /// Standby poll period for wake-on-motion
    pub fn standby_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.motion.standby_poll_ms)
    }

    /// End the trip: distance and vehicle error budget start over
    pub fn reset_trip(&mut self) {
        self.trip.reset();
        self.last_distance = None;
        self.obd_errors = 0;
    }

    /// A restored vehicle bus starts with a clean error budget
    pub fn reset_vehicle_errors(&mut self) {
        self.obd_errors = 0;
    }

    pub fn trip_meters(&self) -> u32 {
        self.trip.meters()
    }

    /// Last calendar date seen on the position source (`DDMMYY`)
    pub fn last_date(&self) -> Option<u32> {
        self.last_date
    }
}
