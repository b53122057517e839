// SPDX-License-Identifier: Apache-2.0
//! Driver for the MLX90640 thermal camera.
//!
//! The camera exposes its RAM, EEPROM and control registers over I²C with
//! 2-byte big-endian register addresses. A capture is available once the
//! ready bit in the status register is set; the driver then acknowledges the
//! capture, pulls the full 832-word frame block, clears the ready bit, and
//! records the control register so the compensation stage knows which page
//! layout the frame was captured with.

mod compensation;
pub(crate) mod eeprom;

use core::convert::TryFrom;

use embedded_hal::blocking::i2c;
use log::{debug, info};

use crate::error::{Error, LibraryError};
use crate::util::is_bit_set;

pub use compensation::{CompensatedFrame, FrameCompensator, ABSOLUTE_ZERO_CELSIUS};
pub use eeprom::{CalibrationParameters, CalibrationRange, EEPROM_WORDS};

/// The height of the image captured by the sensor in pixels.
pub const HEIGHT: usize = 24;

/// The width of the image captured by the sensor in pixels.
pub const WIDTH: usize = 32;

/// The total number of pixels an MLX90640 has.
pub const NUM_PIXELS: usize = HEIGHT * WIDTH;

/// 768 pixels plus the 64-word auxiliary telemetry block.
pub const FRAME_WORDS: usize = NUM_PIXELS + 64;

/// Calibration ranges carried by the EEPROM.
pub const NUM_RANGES: usize = 4;

/// Measurement pages a frame's pixels are split across.
pub const NUM_PAGES: usize = 2;

/// Cyclic-pixel correction channels.
pub const NUM_TGC: usize = 2;

/// Factory-default I²C address.
pub const DEFAULT_ADDRESS: u8 = 0x33;

pub(crate) const STATUS_REGISTER: u16 = 0x8000;
pub(crate) const CONTROL_REGISTER: u16 = 0x800D;
pub(crate) const RAM_BASE: u16 = 0x0400;
pub(crate) const EEPROM_BASE: u16 = 0x2400;

/// Bit 3 of the status register: a new frame is ready in RAM.
pub(crate) const STATUS_NEW_DATA: u16 = 0x0008;

/// Overwrite-enable plus start-measurement, written to acknowledge a capture.
const STATUS_CAPTURE_ACK: u16 = 0x0030;

/// Bit 12 of the control register selects the chess access pattern.
pub(crate) const CONTROL_CHESS_PATTERN: u16 = 1 << 12;

const CONTROL_FRAME_RATE_MASK: u16 = 0x0380;
const CONTROL_FRAME_RATE_SHIFT: u16 = 7;

/// How many times the EEPROM is read and bitwise-ORed during load.
///
/// Inherited bit-error mitigation; it only helps against stuck-low failures.
const EEPROM_READS: usize = 3;

/// The possible capture rates, encoded as a 3-bit code in the control
/// register. Before using the higher rates, ensure the I²C bus is fast
/// enough to move a full frame between captures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum FrameRate {
    /// 0.5 Hz, one frame every two seconds.
    Half,

    /// 1 Hz.
    One,

    /// 2 Hz, the device default.
    Two,

    /// 4 Hz.
    Four,

    /// 8 Hz.
    Eight,

    /// 16 Hz.
    Sixteen,

    /// 32 Hz.
    ThirtyTwo,

    /// 64 Hz.
    SixtyFour,
}

impl FrameRate {
    /// Map a frame rate variant into the 3-bit code used by the camera.
    pub(crate) fn as_raw(&self) -> u16 {
        match self {
            Self::Half => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 3,
            Self::Eight => 4,
            Self::Sixteen => 5,
            Self::ThirtyTwo => 6,
            Self::SixtyFour => 7,
        }
    }

    pub(crate) fn from_raw(raw_value: u16) -> Result<Self, LibraryError> {
        match raw_value {
            0 => Ok(Self::Half),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Four),
            4 => Ok(Self::Eight),
            5 => Ok(Self::Sixteen),
            6 => Ok(Self::ThirtyTwo),
            7 => Ok(Self::SixtyFour),
            _ => Err(LibraryError::InvalidData("Invalid frame rate given")),
        }
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::Two
    }
}

impl TryFrom<f32> for FrameRate {
    type Error = LibraryError;

    /// Attempt to create a `FrameRate` from a number.
    ///
    /// This only works if the source number *exactly* matches one of the
    /// valid rates; anything else is a configuration error.
    #[allow(clippy::float_cmp)]
    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if value == 0.5 {
            Ok(Self::Half)
        } else if value == 1.0 {
            Ok(Self::One)
        } else if value == 2.0 {
            Ok(Self::Two)
        } else if value == 4.0 {
            Ok(Self::Four)
        } else if value == 8.0 {
            Ok(Self::Eight)
        } else if value == 16.0 {
            Ok(Self::Sixteen)
        } else if value == 32.0 {
            Ok(Self::ThirtyTwo)
        } else if value == 64.0 {
            Ok(Self::SixtyFour)
        } else {
            Err(LibraryError::InvalidData(
                "The given number does not match a valid frame rate",
            ))
        }
    }
}

impl From<FrameRate> for f32 {
    fn from(frame_rate: FrameRate) -> Self {
        match frame_rate {
            FrameRate::Half => 0.5,
            FrameRate::One => 1f32,
            FrameRate::Two => 2f32,
            FrameRate::Four => 4f32,
            FrameRate::Eight => 8f32,
            FrameRate::Sixteen => 16f32,
            FrameRate::ThirtyTwo => 32f32,
            FrameRate::SixtyFour => 64f32,
        }
    }
}

/// One device capture: 832 signed 16-bit words plus the status and control
/// words observed alongside it.
///
/// A frame is only handed out once the device's ready bit has been observed
/// set, so the pixel data is always a complete capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub(crate) words: [i16; FRAME_WORDS],
    control: u16,
    status: u16,
}

impl RawFrame {
    pub fn new(words: [i16; FRAME_WORDS], control: u16, status: u16) -> Self {
        Self {
            words,
            control,
            status,
        }
    }

    /// The 768 raw pixel counts, row-major.
    pub fn pixels(&self) -> &[i16] {
        &self.words[..NUM_PIXELS]
    }

    /// The 64-word auxiliary telemetry block.
    pub(crate) fn aux(&self) -> &[i16] {
        &self.words[NUM_PIXELS..]
    }

    /// Was this frame captured with the chess access pattern?
    pub fn chess_pattern(&self) -> bool {
        self.control & CONTROL_CHESS_PATTERN != 0
    }

    /// Which measurement page the pixel at `index` belongs to.
    pub(crate) fn page_of(&self, index: usize) -> usize {
        if self.chess_pattern() {
            (index & 1) ^ ((index / WIDTH) & 1)
        } else {
            (index / WIDTH) % 2
        }
    }
}

/// The MLX90640 camera driver.
///
/// Owns the bus handle, the decoded calibration, and the per-frame
/// compensation state. Exclusively owned by its acquisition task; nothing in
/// here is shared.
#[derive(Clone, Debug)]
pub struct Mlx90640<I2C> {
    /// The I²C bus this camera is accessible on.
    bus: I2C,

    /// The I²C address this camera is accessible at.
    address: u8,

    compensator: FrameCompensator,
}

impl<I2C> Mlx90640<I2C>
where
    I2C: i2c::WriteRead + i2c::Write,
{
    /// Create a driver for the camera at `address`, negotiating the capture
    /// rate and loading the calibration data from the device.
    pub fn new(bus: I2C, address: u8, frame_rate: FrameRate) -> Result<Self, Error<I2C>> {
        let mut bus = bus;
        set_frame_rate(&mut bus, address, frame_rate)?;
        let eeprom = read_eeprom(&mut bus, address)?;
        let calibration = CalibrationParameters::from_words(&eeprom)?;
        info!(
            "MLX90640 {:04X}{:04X}{:04X}: {} broken, {} outlier pixels",
            calibration.device_id()[0],
            calibration.device_id()[1],
            calibration.device_id()[2],
            calibration.broken_pixels().len(),
            calibration.outlier_pixels().len(),
        );
        Ok(Self {
            bus,
            address,
            compensator: FrameCompensator::new(calibration),
        })
    }

    /// Change the capture rate on a running camera.
    pub fn set_frame_rate(&mut self, frame_rate: FrameRate) -> Result<(), Error<I2C>> {
        set_frame_rate(&mut self.bus, self.address, frame_rate)
    }

    /// Read the capture rate back from the control register.
    pub fn frame_rate(&mut self) -> Result<FrameRate, Error<I2C>> {
        let control = read_register(&mut self.bus, self.address, CONTROL_REGISTER)?;
        let raw = (control & CONTROL_FRAME_RATE_MASK) >> CONTROL_FRAME_RATE_SHIFT;
        Ok(FrameRate::from_raw(raw)?)
    }

    pub fn calibration(&self) -> &CalibrationParameters {
        self.compensator.calibration()
    }

    pub fn emissivity(&self) -> f32 {
        self.compensator.emissivity()
    }

    pub fn set_emissivity(&mut self, emissivity: f32) {
        self.compensator.set_emissivity(emissivity);
    }

    /// Check for a completed capture without blocking.
    ///
    /// Returns `Ok(None)` when the device has not finished a capture yet;
    /// the caller re-polls on its own schedule. When the ready bit is set,
    /// the capture is acknowledged, the frame block is read out, the ready
    /// bit is cleared, and the control register is sampled for the page
    /// layout.
    pub fn poll_frame(&mut self) -> Result<Option<RawFrame>, Error<I2C>> {
        let status = read_register(&mut self.bus, self.address, STATUS_REGISTER)?;
        if !is_bit_set(status, 3) {
            return Ok(None);
        }
        write_register(&mut self.bus, self.address, STATUS_REGISTER, STATUS_CAPTURE_ACK)?;

        let mut frame_bytes = [0u8; FRAME_WORDS * 2];
        self.bus
            .write_read(self.address, &RAM_BASE.to_be_bytes(), &mut frame_bytes)
            .map_err(Error::I2cWriteReadError)?;

        write_register(
            &mut self.bus,
            self.address,
            STATUS_REGISTER,
            status & !STATUS_NEW_DATA,
        )?;
        let control = read_register(&mut self.bus, self.address, CONTROL_REGISTER)?;

        let mut words = [0i16; FRAME_WORDS];
        for (word, pair) in words.iter_mut().zip(frame_bytes.chunks_exact(2)) {
            *word = i16::from_be_bytes([pair[0], pair[1]]);
        }
        debug!("MLX90640 frame captured, control {:#06X}", control);
        Ok(Some(RawFrame {
            words,
            control,
            status,
        }))
    }

    /// Compute per-pixel temperatures for a captured frame.
    pub fn compensate(&mut self, frame: &RawFrame) -> Result<CompensatedFrame, LibraryError> {
        self.compensator.compensate(frame)
    }
}

fn read_register<I2C>(bus: &mut I2C, i2c_address: u8, register: u16) -> Result<u16, Error<I2C>>
where
    I2C: i2c::WriteRead + i2c::Write,
{
    let mut register_bytes = [0u8; 2];
    bus.write_read(i2c_address, &register.to_be_bytes(), &mut register_bytes)
        .map_err(Error::I2cWriteReadError)?;
    Ok(u16::from_be_bytes(register_bytes))
}

fn write_register<I2C>(
    bus: &mut I2C,
    i2c_address: u8,
    register: u16,
    value: u16,
) -> Result<(), Error<I2C>>
where
    I2C: i2c::WriteRead + i2c::Write,
{
    let register_address = register.to_be_bytes();
    let value_bytes = value.to_be_bytes();
    let combined: [u8; 4] = [
        register_address[0],
        register_address[1],
        value_bytes[0],
        value_bytes[1],
    ];
    bus.write(i2c_address, &combined).map_err(Error::I2cWriteError)?;
    Ok(())
}

/// Write the 3-bit rate code into the control register, preserving the other
/// bits.
fn set_frame_rate<I2C>(bus: &mut I2C, address: u8, frame_rate: FrameRate) -> Result<(), Error<I2C>>
where
    I2C: i2c::WriteRead + i2c::Write,
{
    let mut control = read_register(bus, address, CONTROL_REGISTER)?;
    control &= !CONTROL_FRAME_RATE_MASK;
    control |= frame_rate.as_raw() << CONTROL_FRAME_RATE_SHIFT;
    write_register(bus, address, CONTROL_REGISTER, control)
}

/// Dump the EEPROM, reading it [`EEPROM_READS`] times and bitwise-ORing the
/// images together.
fn read_eeprom<I2C>(bus: &mut I2C, address: u8) -> Result<[u16; EEPROM_WORDS], Error<I2C>>
where
    I2C: i2c::WriteRead + i2c::Write,
{
    let eeprom_address = EEPROM_BASE.to_be_bytes();
    let mut combined = [0u8; EEPROM_WORDS * 2];
    bus.write_read(address, &eeprom_address, &mut combined)
        .map_err(Error::I2cWriteReadError)?;
    for _ in 1..EEPROM_READS {
        let mut consecutive = [0u8; EEPROM_WORDS * 2];
        bus.write_read(address, &eeprom_address, &mut consecutive)
            .map_err(Error::I2cWriteReadError)?;
        for (byte, other) in combined.iter_mut().zip(consecutive.iter()) {
            *byte |= other;
        }
    }
    let mut words = [0u16; EEPROM_WORDS];
    crate::util::be_words(&combined, &mut words);
    Ok(words)
}
