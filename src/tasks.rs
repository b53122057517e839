// SPDX-License-Identifier: Apache-2.0
//! Periodic task loops.
//!
//! Every task is a cooperative poll loop on its own thread: compare elapsed
//! time to the task's period, sleep a short slice when not yet due, and
//! check the shared cancellation token once per cycle. Acquisition tasks
//! own their drivers exclusively and write into [`SharedSensorState`];
//! transmit tasks read whatever is current and push it onto the bus. No
//! task blocks on another.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use embedded_hal::blocking::i2c;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use log::{error, info, warn};

use crate::config::{CAN_SEND_TIMEOUT, POLL_SLICE, SESSION_LOG_POLL_PERIOD};
use crate::kalman::RangeFilter;
use crate::max11617::Max11617;
use crate::mcp2515::{Mcp2515, MAX_PAYLOAD};
use crate::mlx90640::{Mlx90640, NUM_PIXELS};
use crate::session::SessionLogger;
use crate::state::{SharedSensorState, TestSession};

/// A cooperative periodic ticker.
///
/// Replaces literal busy-poll loops: [`wait`][Ticker::wait] sleeps in short
/// slices until the period has elapsed, re-checking the cancellation token
/// on every slice.
pub struct Ticker {
    period: Duration,
    last: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Instant::now(),
        }
    }

    /// Block until the next period boundary. Returns `false` once shutdown
    /// has been requested.
    pub fn wait(&mut self, shutdown: &AtomicBool) -> bool {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let elapsed = self.last.elapsed();
            if elapsed >= self.period {
                self.last = Instant::now();
                return true;
            }
            thread::sleep(POLL_SLICE.min(self.period - elapsed));
        }
    }
}

/// The seam between the acquisition layer and whatever measures distance.
///
/// The node only needs a current reading in millimetres; the sensor is an
/// external collaborator behind this trait.
pub trait RangeSensor {
    type Error: fmt::Display;

    /// Latest range reading in millimetres.
    fn read_distance(&mut self) -> Result<u16, Self::Error>;
}

/// Message types each node republishes, with their payload encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TelemetryMessage {
    /// Average tire temperature, deci-Celsius, 2-byte little-endian.
    TireTempAverage,

    /// The three linpot ADC channels, little-endian 16-bit each.
    Linpot,

    /// Smoothed ride height, millimetres, 2-byte little-endian.
    RideHeight,
}

impl TelemetryMessage {
    /// Encode the current shared-state value for this message.
    pub fn encode(&self, state: &SharedSensorState) -> ArrayVec<u8, MAX_PAYLOAD> {
        let mut payload = ArrayVec::new();
        match self {
            TelemetryMessage::TireTempAverage => {
                payload.extend(state.tire_temp_avg().to_le_bytes());
            }
            TelemetryMessage::Linpot => {
                for channel in state.adc() {
                    payload.extend(channel.to_le_bytes());
                }
            }
            TelemetryMessage::RideHeight => {
                let millimetres = state.ride_height().round().clamp(0.0, f32::from(u16::MAX));
                payload.extend((millimetres as u16).to_le_bytes());
            }
        }
        payload
    }
}

/// Acquire thermal frames: poll for a capture, compensate it, publish it.
pub fn spawn_thermal_task<I2C>(
    mut camera: Mlx90640<I2C>,
    state: Arc<SharedSensorState>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    I2C: i2c::WriteRead + i2c::Write + Send + 'static,
    <I2C as i2c::WriteRead>::Error: fmt::Debug,
    <I2C as i2c::Write>::Error: fmt::Debug,
{
    thread::spawn(move || {
        let mut ticker = Ticker::new(period);
        while ticker.wait(&shutdown) {
            match camera.poll_frame() {
                Ok(Some(raw)) => match camera.compensate(&raw) {
                    Ok(frame) => state.publish_thermal(&frame),
                    Err(reason) => error!("thermal compensation failed: {}", reason),
                },
                // No capture yet; the device runs on its own cadence.
                Ok(None) => {}
                Err(reason) => error!("thermal frame read failed: {}", reason),
            }
        }
        info!("thermal task stopped");
    })
}

/// Acquire range readings through the Kalman filter.
pub fn spawn_range_task<S>(
    mut sensor: S,
    mut filter: RangeFilter,
    state: Arc<SharedSensorState>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    S: RangeSensor + Send + 'static,
{
    thread::spawn(move || {
        let mut ticker = Ticker::new(period);
        let mut last_cycle = Instant::now();
        while ticker.wait(&shutdown) {
            filter.predict(last_cycle.elapsed().as_secs_f32());
            last_cycle = Instant::now();
            match sensor.read_distance() {
                Ok(millimetres) => {
                    filter.update(f32::from(millimetres));
                    state.set_ride_height(filter.position());
                }
                Err(reason) => warn!("range read failed: {}", reason),
            }
        }
        info!("range task stopped");
    })
}

/// Acquire the linpot ADC channels.
pub fn spawn_adc_task<I2C>(
    mut adc: Max11617<I2C>,
    state: Arc<SharedSensorState>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    I2C: i2c::Read + i2c::Write + Send + 'static,
    <I2C as i2c::Read>::Error: fmt::Debug,
    <I2C as i2c::Write>::Error: fmt::Debug,
{
    thread::spawn(move || {
        let mut ticker = Ticker::new(period);
        while ticker.wait(&shutdown) {
            match adc.read() {
                Ok(channels) => state.set_adc(&channels),
                Err(reason) => warn!("ADC read failed: {}", reason),
            }
        }
        info!("ADC task stopped");
    })
}

/// Periodically transmit one telemetry message from shared state.
pub fn spawn_can_tx_task<SPI, CS>(
    can: Arc<Mutex<Mcp2515<SPI, CS>>>,
    state: Arc<SharedSensorState>,
    message: TelemetryMessage,
    id: u16,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    SPI: Transfer<u8> + Send + 'static,
    CS: OutputPin + Send + 'static,
    <SPI as Transfer<u8>>::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
    thread::spawn(move || {
        let mut ticker = Ticker::new(period);
        while ticker.wait(&shutdown) {
            let payload = message.encode(&state);
            let mut controller = can.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(reason) = controller.send(id, &payload, CAN_SEND_TIMEOUT) {
                // Dropped frame; consumers want current values, not every
                // sample, so the loop just carries on.
                warn!("{:?} transmit on {:#05X} failed: {}", message, id, reason);
            }
        }
        info!("{:?} transmit task stopped", message);
    })
}

/// Poll for inbound control frames and update the active session.
pub fn spawn_can_rx_task<SPI, CS>(
    can: Arc<Mutex<Mcp2515<SPI, CS>>>,
    state: Arc<SharedSensorState>,
    session_id: u16,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    SPI: Transfer<u8> + Send + 'static,
    CS: OutputPin + Send + 'static,
    <SPI as Transfer<u8>>::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
    thread::spawn(move || {
        let mut ticker = Ticker::new(period);
        while ticker.wait(&shutdown) {
            let received = {
                let mut controller = can.lock().unwrap_or_else(PoisonError::into_inner);
                controller.receive()
            };
            match received {
                Ok(Some(frame)) if frame.id == session_id && frame.len() == 2 => {
                    let word = u16::from_le_bytes([frame.data[0], frame.data[1]]);
                    let commanded = TestSession::from_word(word);
                    if commanded != state.session() {
                        info!(
                            "session command: id {} {}",
                            commanded.id,
                            if commanded.active { "started" } else { "stopped" }
                        );
                    }
                    state.set_session_word(word);
                }
                // Anything else on the bus is not ours.
                Ok(_) => {}
                Err(reason) => warn!("CAN receive failed: {}", reason),
            }
        }
        info!("command task stopped");
    })
}

/// Watch the thermal generation flag and append a log line per new frame.
pub fn spawn_session_log_task(
    mut logger: SessionLogger,
    state: Arc<SharedSensorState>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut ticker = Ticker::new(SESSION_LOG_POLL_PERIOD);
        let mut last_generation: Option<bool> = None;
        let mut pixels = [0i16; NUM_PIXELS];
        while ticker.wait(&shutdown) {
            // Rotate/close before looking at the frame so a just-ended
            // session never receives another line.
            if let Err(reason) = logger.update_session(state.session()) {
                error!("session log rotation failed: {}", reason);
                continue;
            }
            let fresh = state.with_thermal(|cell| match last_generation {
                // First observation only latches the current generation.
                None => {
                    last_generation = Some(cell.generation);
                    false
                }
                Some(seen) if seen != cell.generation => {
                    last_generation = Some(cell.generation);
                    pixels.copy_from_slice(&cell.pixels);
                    true
                }
                Some(_) => false,
            });
            if fresh {
                if let Err(reason) = logger.log_frame(&pixels) {
                    error!("session log write failed: {}", reason);
                }
            }
        }
        info!("session log task stopped");
    })
}
