// SPDX-License-Identifier: Apache-2.0
//! Driver for the MCP2515 stand-alone CAN controller.
//!
//! The controller is a register file behind a half-duplex SPI link: every
//! operation is a single-byte opcode followed by address and data bytes,
//! with chip select held low for the duration of the transaction. The
//! driver wraps each register transaction in a bounded retry policy and
//! verifies mode transitions by reading the mode bits back.
//!
//! Only the subset needed for point-to-point telemetry is implemented:
//! transmit buffer 0, receive buffer 0, and the acceptance filters/masks.

mod registers;

use std::convert::TryFrom;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use log::warn;

use registers::*;

pub use registers::OperatingMode;

/// The highest standard (11-bit) CAN identifier.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// The most data bytes a CAN frame can carry.
pub const MAX_PAYLOAD: usize = 8;

/// Delay between attempts of a failed register transaction.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Poll interval while waiting for a transmission to complete.
const TRANSMIT_POLL_SLICE: Duration = Duration::from_millis(10);

/// Settling time after a reset pulse.
const RESET_DELAY: Duration = Duration::from_millis(100);

/// A received (or to-be-sent) CAN frame: 11-bit identifier and up to 8 data
/// bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub data: ArrayVec<u8, MAX_PAYLOAD>,
}

impl CanFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Errors from the CAN controller driver.
pub enum Error<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Errors originating from the SPI implementation.
    Spi(<SPI as Transfer<u8>>::Error),

    /// Errors originating from the chip-select pin.
    ChipSelect(CS::Error),

    /// A mode transition did not read back as requested.
    ModeVerification { requested: OperatingMode, actual: u8 },

    /// The identifier does not fit in 11 bits. Caller error.
    InvalidId(u16),

    /// The payload exceeds 8 bytes. Caller error.
    PayloadTooLong(usize),

    /// The filter or mask slot index is out of range. Caller error.
    InvalidSlot { kind: &'static str, slot: usize },

    /// The transmission did not complete in time and was aborted. The frame
    /// is dropped; there is no retry queue.
    TransmitTimeout,

    /// A register transaction kept failing until the retry budget and the
    /// wall-clock ceiling were both spent. Fatal for the operation.
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },
}

// Custom Debug implementation so the bus and pin types don't need to
// implement Debug themselves.
impl<SPI, CS> fmt::Debug for Error<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    <SPI as Transfer<u8>>::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi_error) => f.debug_tuple("Error::Spi").field(spi_error).finish(),
            Error::ChipSelect(cs_error) => {
                f.debug_tuple("Error::ChipSelect").field(cs_error).finish()
            }
            Error::ModeVerification { requested, actual } => f
                .debug_struct("Error::ModeVerification")
                .field("requested", requested)
                .field("actual", actual)
                .finish(),
            Error::InvalidId(id) => f.debug_tuple("Error::InvalidId").field(id).finish(),
            Error::PayloadTooLong(len) => {
                f.debug_tuple("Error::PayloadTooLong").field(len).finish()
            }
            Error::InvalidSlot { kind, slot } => f
                .debug_struct("Error::InvalidSlot")
                .field("kind", kind)
                .field("slot", slot)
                .finish(),
            Error::TransmitTimeout => f.write_str("Error::TransmitTimeout"),
            Error::RetriesExhausted {
                operation,
                attempts,
            } => f
                .debug_struct("Error::RetriesExhausted")
                .field("operation", operation)
                .field("attempts", attempts)
                .finish(),
        }
    }
}

impl<SPI, CS> fmt::Display for Error<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    <SPI as Transfer<u8>>::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi_error) => write!(f, "SPI error: {:?}", spi_error),
            Error::ChipSelect(cs_error) => write!(f, "chip-select error: {:?}", cs_error),
            Error::ModeVerification { requested, actual } => write!(
                f,
                "mode change to {:?} read back as {:#04X}",
                requested, actual
            ),
            Error::InvalidId(id) => {
                write!(f, "CAN ID must be 11 bits (0x000 to 0x7FF), got {:#05X}", id)
            }
            Error::PayloadTooLong(len) => {
                write!(f, "CAN data length must be 8 bytes or less, got {}", len)
            }
            Error::InvalidSlot { kind, slot } => write!(f, "no {} slot {}", kind, slot),
            Error::TransmitTimeout => write!(f, "transmission timed out and was aborted"),
            Error::RetriesExhausted {
                operation,
                attempts,
            } => write!(f, "{} failed after {} attempts", operation, attempts),
        }
    }
}

impl<SPI, CS> std::error::Error for Error<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    <SPI as Transfer<u8>>::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
}

/// The MCP2515 driver.
///
/// The underlying bus is single-master half-duplex, so when the controller
/// is shared across transmit and receive tasks it is wrapped in one mutex
/// serializing all SPI transactions; every holder performs short,
/// bounded-time transactions.
pub struct Mcp2515<SPI, CS> {
    spi: SPI,
    cs: CS,
    max_retries: u32,
    op_timeout: Duration,
}

impl<SPI, CS> Mcp2515<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    <SPI as Transfer<u8>>::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
    /// Reset the controller over SPI and program the bit timing for the
    /// bus's nominal 250 kbit/s rate.
    ///
    /// The controller comes out of reset in configuration mode; call
    /// [`set_normal_mode`][Self::set_normal_mode] (after programming any
    /// acceptance filters) to go on-bus.
    pub fn new(
        spi: SPI,
        cs: CS,
        max_retries: u32,
        op_timeout: Duration,
    ) -> Result<Self, Error<SPI, CS>> {
        let mut controller = Self {
            spi,
            cs,
            max_retries,
            op_timeout,
        };
        controller.reset()?;
        controller.configure_bit_timing()?;
        Ok(controller)
    }

    /// One chip-select-framed SPI transaction.
    ///
    /// Chip select is raised again even when the transfer fails.
    fn transaction(&mut self, buffer: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        self.cs.set_low().map_err(Error::ChipSelect)?;
        let result = self
            .spi
            .transfer(buffer)
            .map(|_| ())
            .map_err(Error::Spi);
        self.cs.set_high().map_err(Error::ChipSelect)?;
        result
    }

    /// Run `operation` until it succeeds, the retry budget is spent, or the
    /// wall-clock ceiling is hit, whichever comes first.
    fn with_retries<T>(
        &mut self,
        operation: &'static str,
        mut op: impl FnMut(&mut Self) -> Result<T, Error<SPI, CS>>,
    ) -> Result<T, Error<SPI, CS>> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op(self) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!(
                        "{} failed (attempt {} of {}): {}",
                        operation, attempts, self.max_retries, error
                    );
                    if attempts >= self.max_retries || started.elapsed() > self.op_timeout {
                        return Err(Error::RetriesExhausted {
                            operation,
                            attempts,
                        });
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    fn read_register_once(&mut self, address: u8) -> Result<u8, Error<SPI, CS>> {
        let mut buffer = [OPCODE_READ, address, 0x00];
        self.transaction(&mut buffer)?;
        Ok(buffer[2])
    }

    fn write_register_once(&mut self, address: u8, value: u8) -> Result<(), Error<SPI, CS>> {
        let mut buffer = [OPCODE_WRITE, address, value];
        self.transaction(&mut buffer)
    }

    fn bit_modify_once(
        &mut self,
        address: u8,
        mask: u8,
        value: u8,
    ) -> Result<(), Error<SPI, CS>> {
        let mut buffer = [OPCODE_BIT_MODIFY, address, mask, value];
        self.transaction(&mut buffer)
    }

    /// Assert the reset instruction and wait for the controller to settle.
    pub fn reset(&mut self) -> Result<(), Error<SPI, CS>> {
        self.with_retries("reset", |controller| {
            let mut buffer = [OPCODE_RESET];
            controller.transaction(&mut buffer)?;
            thread::sleep(RESET_DELAY);
            Ok(())
        })
    }

    pub fn read_register(&mut self, address: u8) -> Result<u8, Error<SPI, CS>> {
        self.with_retries("register read", |controller| {
            controller.read_register_once(address)
        })
    }

    pub fn write_register(&mut self, address: u8, value: u8) -> Result<(), Error<SPI, CS>> {
        self.with_retries("register write", |controller| {
            controller.write_register_once(address, value)
        })
    }

    pub fn bit_modify(&mut self, address: u8, mask: u8, value: u8) -> Result<(), Error<SPI, CS>> {
        self.with_retries("register bit-modify", |controller| {
            controller.bit_modify_once(address, mask, value)
        })
    }

    /// The quick-status byte: bit 0 reflects a pending frame in receive
    /// buffer 0.
    pub fn read_status(&mut self) -> Result<u8, Error<SPI, CS>> {
        self.with_retries("status read", |controller| {
            let mut buffer = [OPCODE_READ_STATUS, 0x00];
            controller.transaction(&mut buffer)?;
            Ok(buffer[1])
        })
    }

    fn configure_bit_timing(&mut self) -> Result<(), Error<SPI, CS>> {
        // 250 kbit/s with a 8 MHz oscillator.
        self.write_register(CNF1, 0x00)?;
        self.write_register(CNF2, 0xB1)?;
        self.write_register(CNF3, 0x05)
    }

    /// Request an operating mode and verify it by reading the mode bits
    /// back.
    pub fn set_mode(&mut self, mode: OperatingMode) -> Result<(), Error<SPI, CS>> {
        self.with_retries("mode change", |controller| {
            controller.write_register_once(CANCTRL, mode.into())?;
            let actual = controller.read_register_once(CANCTRL)? & MODE_MASK;
            match OperatingMode::try_from(actual) {
                Ok(current) if current == mode => Ok(()),
                _ => Err(Error::ModeVerification {
                    requested: mode,
                    actual,
                }),
            }
        })
    }

    pub fn set_normal_mode(&mut self) -> Result<(), Error<SPI, CS>> {
        self.set_mode(OperatingMode::Normal)
    }

    pub fn set_loopback_mode(&mut self) -> Result<(), Error<SPI, CS>> {
        self.set_mode(OperatingMode::Loopback)
    }

    pub fn set_config_mode(&mut self) -> Result<(), Error<SPI, CS>> {
        self.set_mode(OperatingMode::Configuration)
    }

    /// Transmit one frame, waiting up to `timeout` for the controller to
    /// win arbitration.
    ///
    /// Oversized identifiers and payloads are rejected synchronously without
    /// touching the bus. On timeout the pending transmission is aborted and
    /// the frame is dropped.
    pub fn send(
        &mut self,
        id: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error<SPI, CS>> {
        if id > MAX_STANDARD_ID {
            return Err(Error::InvalidId(id));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLong(data.len()));
        }

        self.with_retries("transmit buffer load", |controller| {
            // The 11-bit identifier is split across SIDH and the top three
            // bits of SIDL.
            controller.write_register_once(TXB0SIDH, (id >> 3) as u8)?;
            controller.write_register_once(TXB0SIDL, ((id << 5) & 0xE0) as u8)?;
            controller.write_register_once(TXB0DLC, data.len() as u8)?;
            for (index, byte) in data.iter().enumerate() {
                controller.write_register_once(TXB0D0 + index as u8, *byte)?;
            }
            controller.bit_modify_once(TXB0CTRL, TXREQ, TXREQ)
        })?;

        // Poll the transmit-request bit until the controller clears it.
        let started = Instant::now();
        while self.read_register(TXB0CTRL)? & TXREQ != 0 {
            if started.elapsed() > timeout {
                self.bit_modify(CANCTRL, ABAT, ABAT)?;
                return Err(Error::TransmitTimeout);
            }
            thread::sleep(TRANSMIT_POLL_SLICE);
        }
        self.bit_modify(CANINTF, TX_INTERRUPT_FLAGS, 0x00)
    }

    /// Pull a pending frame out of receive buffer 0, if any.
    pub fn receive(&mut self) -> Result<Option<CanFrame>, Error<SPI, CS>> {
        let status = self.read_status()?;
        if status & RX0IF == 0 {
            return Ok(None);
        }
        let id_high = self.read_register(RXB0SIDH)?;
        let id_low = self.read_register(RXB0SIDL)?;
        // A DLC above 8 is out of spec; never read past the data registers.
        let length = usize::from(self.read_register(RXB0DLC)? & 0x0F).min(MAX_PAYLOAD);
        let mut data = ArrayVec::new();
        for index in 0..length {
            data.push(self.read_register(RXB0D0 + index as u8)?);
        }
        self.bit_modify(CANINTF, RX0IF, 0x00)?;
        let id = (u16::from(id_high) << 3) | (u16::from(id_low) >> 5);
        Ok(Some(CanFrame { id, data }))
    }

    /// Program one acceptance filter slot with an 11-bit identifier.
    ///
    /// Filters only take effect while the controller is in configuration
    /// mode and the owning bank is enabled.
    pub fn set_acceptance_filter(&mut self, slot: usize, id: u16) -> Result<(), Error<SPI, CS>> {
        if id > MAX_STANDARD_ID {
            return Err(Error::InvalidId(id));
        }
        let base = *FILTER_BASES
            .get(slot)
            .ok_or(Error::InvalidSlot { kind: "filter", slot })?;
        self.write_register(base, (id >> 3) as u8)?;
        self.write_register(base + 1, ((id << 5) & 0xE0) as u8)
    }

    /// Program one acceptance mask slot with an 11-bit mask.
    pub fn set_acceptance_mask(&mut self, slot: usize, mask: u16) -> Result<(), Error<SPI, CS>> {
        if mask > MAX_STANDARD_ID {
            return Err(Error::InvalidId(mask));
        }
        let base = *MASK_BASES
            .get(slot)
            .ok_or(Error::InvalidSlot { kind: "mask", slot })?;
        self.write_register(base, (mask >> 3) as u8)?;
        self.write_register(base + 1, ((mask << 5) & 0xE0) as u8)
    }

    /// Enable or disable acceptance filtering for one receive bank.
    ///
    /// A disabled bank accepts every frame on the bus.
    pub fn enable_filter_bank(&mut self, bank: usize, enabled: bool) -> Result<(), Error<SPI, CS>> {
        let control = *RX_CTRL
            .get(bank)
            .ok_or(Error::InvalidSlot { kind: "filter bank", slot: bank })?;
        let value = if enabled { 0x00 } else { RX_ACCEPT_ANY };
        self.write_register(control, value)
    }
}
