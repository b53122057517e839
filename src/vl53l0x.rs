// SPDX-License-Identifier: Apache-2.0
//! Minimal driver for the VL53L0X time-of-flight ranger.
//!
//! Only the continuous-ranging read path the node needs is implemented:
//! start continuous back-to-back ranging once, then read the latest result
//! whenever the measurement interrupt reports one. Registers use
//! single-byte addresses.

use std::fmt;
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::i2c;
use log::info;

use crate::error::{Error, LibraryError};
use crate::tasks::RangeSensor;

const REGISTER_MODEL_ID: u8 = 0xC0;
const MODEL_ID: u8 = 0xEE;
const REGISTER_SYSRANGE_START: u8 = 0x00;
const SYSRANGE_CONTINUOUS: u8 = 0x02;
const REGISTER_INTERRUPT_STATUS: u8 = 0x13;
const REGISTER_INTERRUPT_CLEAR: u8 = 0x0B;
/// 16-bit range result, big-endian, within the result block.
const REGISTER_RANGE_MM: u8 = 0x1E;

/// How long [`read_distance`][RangeSensor::read_distance] waits for a
/// measurement before giving up.
const MEASUREMENT_TIMEOUT: Duration = Duration::from_millis(100);
const MEASUREMENT_POLL_SLICE: Duration = Duration::from_millis(1);

/// The VL53L0X driver, running in continuous ranging mode.
pub struct Vl53l0x<I2C> {
    bus: I2C,
    address: u8,
}

impl<I2C> Vl53l0x<I2C>
where
    I2C: i2c::WriteRead + i2c::Write,
{
    /// Verify the device identity and start continuous ranging.
    pub fn new(bus: I2C, address: u8) -> Result<Self, Error<I2C>> {
        let mut sensor = Self { bus, address };
        let model = sensor.read_register(REGISTER_MODEL_ID)?;
        if model != MODEL_ID {
            return Err(LibraryError::InvalidData("VL53L0X model id mismatch").into());
        }
        sensor.write_register(REGISTER_SYSRANGE_START, SYSRANGE_CONTINUOUS)?;
        info!("VL53L0X ranging continuously at {:#04X}", address);
        Ok(sensor)
    }

    fn read_register(&mut self, register: u8) -> Result<u8, Error<I2C>> {
        let mut value = [0u8; 1];
        self.bus
            .write_read(self.address, &[register], &mut value)
            .map_err(Error::I2cWriteReadError)?;
        Ok(value[0])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), Error<I2C>> {
        self.bus
            .write(self.address, &[register, value])
            .map_err(Error::I2cWriteError)?;
        Ok(())
    }

    /// The latest completed measurement, if one is pending.
    pub fn read_range_mm(&mut self) -> Result<Option<u16>, Error<I2C>> {
        if self.read_register(REGISTER_INTERRUPT_STATUS)? & 0x07 == 0 {
            return Ok(None);
        }
        let mut range = [0u8; 2];
        self.bus
            .write_read(self.address, &[REGISTER_RANGE_MM], &mut range)
            .map_err(Error::I2cWriteReadError)?;
        self.write_register(REGISTER_INTERRUPT_CLEAR, 0x01)?;
        Ok(Some(u16::from_be_bytes(range)))
    }
}

impl<I2C> RangeSensor for Vl53l0x<I2C>
where
    I2C: i2c::WriteRead + i2c::Write,
    <I2C as i2c::WriteRead>::Error: fmt::Debug,
    <I2C as i2c::Write>::Error: fmt::Debug,
{
    type Error = Error<I2C>;

    fn read_distance(&mut self) -> Result<u16, Self::Error> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(millimetres) = self.read_range_mm()? {
                return Ok(millimetres);
            }
            if waited >= MEASUREMENT_TIMEOUT {
                return Err(LibraryError::Other("range measurement timed out").into());
            }
            thread::sleep(MEASUREMENT_POLL_SLICE);
            waited += MEASUREMENT_POLL_SLICE;
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::convert::Infallible;
    use std::rc::Rc;

    use embedded_hal::blocking::i2c::{Write, WriteRead};

    use super::*;

    /// A byte-addressed register file standing in for the sensor.
    #[derive(Clone)]
    struct MockRangerBus {
        registers: Rc<RefCell<[u8; 256]>>,
    }

    impl Default for MockRangerBus {
        fn default() -> Self {
            Self {
                registers: Rc::new(RefCell::new([0u8; 256])),
            }
        }
    }

    impl MockRangerBus {
        fn new() -> Self {
            let mock = Self::default();
            mock.registers.borrow_mut()[REGISTER_MODEL_ID as usize] = MODEL_ID;
            mock
        }

        fn set(&self, register: u8, value: u8) {
            self.registers.borrow_mut()[register as usize] = value;
        }

        fn get(&self, register: u8) -> u8 {
            self.registers.borrow()[register as usize]
        }
    }

    impl Write for MockRangerBus {
        type Error = Infallible;

        fn write(&mut self, _address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
            let mut registers = self.registers.borrow_mut();
            let base = bytes[0] as usize;
            for (offset, value) in bytes[1..].iter().enumerate() {
                registers[base + offset] = *value;
            }
            // Clearing the interrupt drops the status bits.
            if bytes[0] == REGISTER_INTERRUPT_CLEAR {
                registers[REGISTER_INTERRUPT_STATUS as usize] = 0;
            }
            Ok(())
        }
    }

    impl WriteRead for MockRangerBus {
        type Error = Infallible;

        fn write_read(
            &mut self,
            _address: u8,
            write_buffer: &[u8],
            out_buffer: &mut [u8],
        ) -> Result<(), Self::Error> {
            let registers = self.registers.borrow();
            let base = write_buffer[0] as usize;
            for (offset, value) in out_buffer.iter_mut().enumerate() {
                *value = registers[base + offset];
            }
            Ok(())
        }
    }

    #[test]
    fn construction_checks_the_model_id_and_starts_ranging() {
        let mock = MockRangerBus::new();
        Vl53l0x::new(mock.clone(), 0x29).unwrap();
        assert_eq!(mock.get(REGISTER_SYSRANGE_START), SYSRANGE_CONTINUOUS);

        let imposter = MockRangerBus::default();
        assert!(Vl53l0x::new(imposter, 0x29).is_err());
    }

    #[test]
    fn range_reads_wait_for_the_measurement_interrupt() {
        let mock = MockRangerBus::new();
        let mut sensor = Vl53l0x::new(mock.clone(), 0x29).unwrap();
        assert_eq!(sensor.read_range_mm().unwrap(), None);

        mock.set(REGISTER_INTERRUPT_STATUS, 0x04);
        mock.set(REGISTER_RANGE_MM, 0x01);
        mock.set(REGISTER_RANGE_MM + 1, 0x41);
        assert_eq!(sensor.read_range_mm().unwrap(), Some(0x0141));
        // The interrupt was acknowledged; no measurement is pending now.
        assert_eq!(sensor.read_range_mm().unwrap(), None);
    }
}
