// SPDX-License-Identifier: Apache-2.0
//! Cross-task shared state.
//!
//! `SharedSensorState` is the only mutable resource shared between tasks.
//! Scalar cells are atomics with last-writer-wins semantics; the composite
//! thermal frame and its generation flag live under one mutex so the pair
//! is always updated and observed as a unit. No task ever blocks on another
//! through this type; the mutex is only held for a copy.

use std::sync::atomic::{AtomicI16, AtomicU16, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::ADC_CHANNELS;
use crate::mlx90640::{CompensatedFrame, NUM_PIXELS};

/// A remotely-commanded logging interval.
///
/// Carried on the bus as a 16-bit word: bit 15 is the active flag, bits
/// 0–14 are the numeric session id. Session identity is external state; it
/// is never derived locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestSession {
    pub id: u16,
    pub active: bool,
}

impl TestSession {
    pub const ACTIVE_FLAG: u16 = 0x8000;

    pub fn inactive() -> Self {
        Self {
            id: 0,
            active: false,
        }
    }

    pub fn from_word(word: u16) -> Self {
        Self {
            id: word & !Self::ACTIVE_FLAG,
            active: word & Self::ACTIVE_FLAG != 0,
        }
    }

    pub fn to_word(self) -> u16 {
        let mut word = self.id & !Self::ACTIVE_FLAG;
        if self.active {
            word |= Self::ACTIVE_FLAG;
        }
        word
    }
}

/// The composite thermal cell: the latest compensated frame plus a
/// generation flag that toggles on every publication.
///
/// The flag signals "new frame" to readers without a queue; readers keep
/// the last generation they saw and act when it differs.
#[derive(Debug)]
pub struct ThermalCell {
    pub generation: bool,
    /// Pixel temperatures in deci-Celsius, row-major.
    pub pixels: [i16; NUM_PIXELS],
    /// Sensor ambient temperature in Celsius.
    pub ambient: f32,
}

/// Shared cells written by the acquisition and command tasks and read by
/// the transmit and logging tasks.
#[derive(Debug)]
pub struct SharedSensorState {
    tire_temp_avg: AtomicI16,
    thermal: Mutex<ThermalCell>,
    /// Smoothed ride height in millimetres, stored as f32 bits.
    ride_height: AtomicU32,
    adc: [AtomicU16; ADC_CHANNELS],
    session: AtomicU16,
}

impl SharedSensorState {
    pub fn new() -> Self {
        Self {
            tire_temp_avg: AtomicI16::new(0),
            thermal: Mutex::new(ThermalCell {
                generation: false,
                pixels: [0; NUM_PIXELS],
                ambient: 0.0,
            }),
            ride_height: AtomicU32::new(0f32.to_bits()),
            adc: std::array::from_fn(|_| AtomicU16::new(0)),
            session: AtomicU16::new(0),
        }
    }

    /// Publish a compensated frame: the pixel array, the ambient
    /// temperature and the generation flag change together under the lock,
    /// then the average cell is updated.
    pub fn publish_thermal(&self, frame: &CompensatedFrame) {
        let average = frame.average_deci_celsius();
        {
            let mut cell = self.thermal.lock().unwrap_or_else(PoisonError::into_inner);
            for (stored, computed) in cell.pixels.iter_mut().zip(frame.pixels.iter()) {
                *stored = *computed as i16;
            }
            cell.ambient = frame.ambient;
            cell.generation = !cell.generation;
        }
        self.tire_temp_avg.store(average, Ordering::Relaxed);
    }

    /// Run `reader` against the thermal cell under the lock.
    ///
    /// Keep the closure short; it holds the writer out.
    pub fn with_thermal<R>(&self, reader: impl FnOnce(&ThermalCell) -> R) -> R {
        let cell = self.thermal.lock().unwrap_or_else(PoisonError::into_inner);
        reader(&cell)
    }

    /// Latest average tire temperature in deci-Celsius.
    pub fn tire_temp_avg(&self) -> i16 {
        self.tire_temp_avg.load(Ordering::Relaxed)
    }

    pub fn set_ride_height(&self, millimetres: f32) {
        self.ride_height
            .store(millimetres.to_bits(), Ordering::Relaxed);
    }

    /// Latest smoothed ride height in millimetres.
    pub fn ride_height(&self) -> f32 {
        f32::from_bits(self.ride_height.load(Ordering::Relaxed))
    }

    /// Store up to [`ADC_CHANNELS`] channel readings.
    pub fn set_adc(&self, channels: &[u16]) {
        for (cell, value) in self.adc.iter().zip(channels.iter()) {
            cell.store(*value, Ordering::Relaxed);
        }
    }

    pub fn adc(&self) -> [u16; ADC_CHANNELS] {
        let mut values = [0u16; ADC_CHANNELS];
        for (value, cell) in values.iter_mut().zip(self.adc.iter()) {
            *value = cell.load(Ordering::Relaxed);
        }
        values
    }

    pub fn set_session_word(&self, word: u16) {
        self.session.store(word, Ordering::Relaxed);
    }

    pub fn session(&self) -> TestSession {
        TestSession::from_word(self.session.load(Ordering::Relaxed))
    }
}

impl Default for SharedSensorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::mlx90640::NUM_PIXELS;

    #[test]
    fn session_word_round_trip() {
        let session = TestSession::from_word(0x8005);
        assert_eq!(session.id, 5);
        assert!(session.active);
        assert_eq!(session.to_word(), 0x8005);

        let cleared = TestSession::from_word(0x0000);
        assert!(!cleared.active);
        assert_eq!(cleared, TestSession::inactive());

        // The active flag never leaks into the id.
        let max_id = TestSession::from_word(0x7FFF);
        assert_eq!(max_id.id, 0x7FFF);
        assert!(!max_id.active);
    }

    #[test]
    fn publish_updates_cell_and_average_together() {
        let state = SharedSensorState::new();
        let frame = CompensatedFrame {
            pixels: [421.7; NUM_PIXELS],
            ambient: 36.5,
        };
        state.publish_thermal(&frame);
        assert_eq!(state.tire_temp_avg(), 421);
        state.with_thermal(|cell| {
            assert!(cell.generation, "first publication toggles the flag");
            assert_eq!(cell.pixels[0], 421);
            assert_eq!(cell.ambient, 36.5);
        });
        state.publish_thermal(&frame);
        state.with_thermal(|cell| assert!(!cell.generation));
    }

    #[test]
    fn scalar_cells_are_last_writer_wins() {
        let state = SharedSensorState::new();
        state.set_ride_height(57.25);
        assert_eq!(state.ride_height(), 57.25);
        state.set_adc(&[100, 200, 300]);
        assert_eq!(state.adc(), [100, 200, 300]);
        state.set_adc(&[101]);
        assert_eq!(state.adc(), [101, 200, 300]);
    }

    #[test]
    fn concurrent_readers_never_observe_a_torn_frame() {
        let state = Arc::new(SharedSensorState::new());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut frame = CompensatedFrame {
                    pixels: [0.0; NUM_PIXELS],
                    ambient: 0.0,
                };
                for round in 0..2000i32 {
                    let value = (round % 1000) as f32;
                    frame.pixels = [value; NUM_PIXELS];
                    state.publish_thermal(&frame);
                }
                stop.store(true, Ordering::Relaxed);
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let state = Arc::clone(&state);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut last_generation = None;
                    while !stop.load(Ordering::Relaxed) {
                        state.with_thermal(|cell| {
                            if last_generation == Some(cell.generation) {
                                return;
                            }
                            last_generation = Some(cell.generation);
                            let first = cell.pixels[0];
                            assert!(
                                cell.pixels.iter().all(|pixel| *pixel == first),
                                "observed a half-written frame"
                            );
                        });
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
