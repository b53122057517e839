// SPDX-License-Identifier: Apache-2.0
//! Driver for the MAX11617 12-bit ADC.
//!
//! Configuration is two bytes written once at startup; after that every
//! conversion is a block read of two bytes per scanned channel.

use std::fmt;

use arrayvec::ArrayVec;
use embedded_hal::blocking::i2c;

/// Channels available on the MAX11617.
pub const MAX_CHANNELS: usize = 12;

/// Setup byte: external reference, internal clock, unipolar, no reset.
const SETUP_BYTE: u8 = (0b1 << 7) | (0b010 << 4) | (0b0 << 3) | (0b0 << 2) | (0b1 << 1);

/// Configuration byte for scanning channels 0 through `n - 1`, single-ended.
fn configuration_byte(channels: usize) -> u8 {
    (((channels as u8) - 1) << 1) | 0b1
}

pub enum Error<I2C>
where
    I2C: i2c::Read + i2c::Write,
{
    /// Errors originating from a read transaction on the bus.
    I2cReadError(<I2C as i2c::Read>::Error),

    /// Errors originating from a write transaction on the bus.
    I2cWriteError(<I2C as i2c::Write>::Error),

    /// The requested scan length doesn't fit the device. Caller error.
    InvalidChannelCount(usize),
}

impl<I2C> fmt::Debug for Error<I2C>
where
    I2C: i2c::Read + i2c::Write,
    <I2C as i2c::Read>::Error: fmt::Debug,
    <I2C as i2c::Write>::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::I2cReadError(i2c_error) => {
                f.debug_tuple("Error::I2cReadError").field(i2c_error).finish()
            }
            Error::I2cWriteError(i2c_error) => f
                .debug_tuple("Error::I2cWriteError")
                .field(i2c_error)
                .finish(),
            Error::InvalidChannelCount(count) => f
                .debug_tuple("Error::InvalidChannelCount")
                .field(count)
                .finish(),
        }
    }
}

impl<I2C> fmt::Display for Error<I2C>
where
    I2C: i2c::Read + i2c::Write,
    <I2C as i2c::Read>::Error: fmt::Debug,
    <I2C as i2c::Write>::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::I2cReadError(i2c_error) => write!(f, "I2C Error: {:?}", i2c_error),
            Error::I2cWriteError(i2c_error) => write!(f, "I2C Error: {:?}", i2c_error),
            Error::InvalidChannelCount(count) => {
                write!(f, "cannot scan {} channels, device has {}", count, MAX_CHANNELS)
            }
        }
    }
}

impl<I2C> std::error::Error for Error<I2C>
where
    I2C: i2c::Read + i2c::Write,
    <I2C as i2c::Read>::Error: fmt::Debug,
    <I2C as i2c::Write>::Error: fmt::Debug,
{
}

/// The MAX11617 ADC driver, scanning a fixed number of channels.
pub struct Max11617<I2C> {
    bus: I2C,
    address: u8,
    channels: usize,
}

impl<I2C> Max11617<I2C>
where
    I2C: i2c::Read + i2c::Write,
{
    /// Configure the device to scan channels 0 through `channels - 1`.
    pub fn new(bus: I2C, address: u8, channels: usize) -> Result<Self, Error<I2C>> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(Error::InvalidChannelCount(channels));
        }
        let mut bus = bus;
        bus.write(address, &[SETUP_BYTE])
            .map_err(Error::I2cWriteError)?;
        bus.write(address, &[configuration_byte(channels)])
            .map_err(Error::I2cWriteError)?;
        Ok(Self {
            bus,
            address,
            channels,
        })
    }

    /// Read one conversion for every scanned channel.
    ///
    /// Each channel comes back as two bytes; the 12-bit result is the low
    /// nibble of the first byte and all of the second.
    pub fn read(&mut self) -> Result<ArrayVec<u16, MAX_CHANNELS>, Error<I2C>> {
        let mut buffer = [0u8; MAX_CHANNELS * 2];
        let used = &mut buffer[..self.channels * 2];
        self.bus
            .read(self.address, used)
            .map_err(Error::I2cReadError)?;
        let mut values = ArrayVec::new();
        for pair in used.chunks_exact(2) {
            values.push((u16::from(pair[0] & 0x0F) << 8) | u16::from(pair[1]));
        }
        Ok(values)
    }
}
