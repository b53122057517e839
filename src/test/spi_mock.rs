// SPDX-License-Identifier: Apache-2.0
//! A mock MCP2515 behind a mock SPI bus.
//!
//! The mock interprets the controller's SPI opcodes against a 128-byte
//! register file and records every transfer, so tests can assert both
//! register effects and the absence of bus traffic.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

const OPCODE_RESET: u8 = 0xC0;
const OPCODE_READ: u8 = 0x03;
const OPCODE_WRITE: u8 = 0x02;
const OPCODE_BIT_MODIFY: u8 = 0x05;
const OPCODE_READ_STATUS: u8 = 0xA0;

const CANCTRL: u8 = 0x0F;
const CANINTF: u8 = 0x2C;
const TXB0CTRL: u8 = 0x30;
const TXREQ: u8 = 0x08;

#[derive(Copy, Clone, Debug)]
pub(crate) enum MockSpiError {
    /// The device did not acknowledge the transfer.
    Nack,
}

#[derive(Clone)]
pub(crate) struct MockCanController {
    registers: Rc<RefCell<[u8; 128]>>,
    operations: Rc<RefCell<Vec<Vec<u8>>>>,
    /// How many upcoming transfers fail with a NACK.
    fail_next: Rc<Cell<u32>>,
    /// When set, a transmit request completes instantly (TXREQ never reads
    /// back as pending).
    auto_complete_tx: Rc<Cell<bool>>,
}

impl MockCanController {
    pub(crate) fn new() -> Self {
        let mut registers = [0u8; 128];
        registers[CANCTRL as usize] = 0x80;
        Self {
            registers: Rc::new(RefCell::new(registers)),
            operations: Rc::new(RefCell::new(Vec::new())),
            fail_next: Rc::new(Cell::new(0)),
            auto_complete_tx: Rc::new(Cell::new(true)),
        }
    }

    pub(crate) fn register(&self, address: u8) -> u8 {
        self.registers.borrow()[address as usize]
    }

    pub(crate) fn set_register(&self, address: u8, value: u8) {
        self.registers.borrow_mut()[address as usize] = value;
    }

    pub(crate) fn operations(&self) -> Vec<Vec<u8>> {
        self.operations.borrow().clone()
    }

    pub(crate) fn clear_operations(&self) {
        self.operations.borrow_mut().clear();
    }

    pub(crate) fn fail_transfers(&self, count: u32) {
        self.fail_next.set(count);
    }

    pub(crate) fn set_auto_complete_tx(&self, enabled: bool) {
        self.auto_complete_tx.set(enabled);
    }
}

impl Transfer<u8> for MockCanController {
    type Error = MockSpiError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let pending_failures = self.fail_next.get();
        if pending_failures > 0 {
            self.fail_next.set(pending_failures - 1);
            return Err(MockSpiError::Nack);
        }
        self.operations.borrow_mut().push(words.to_vec());
        let mut registers = self.registers.borrow_mut();
        match words[0] {
            OPCODE_RESET => {
                *registers = [0u8; 128];
                registers[CANCTRL as usize] = 0x80;
            }
            OPCODE_READ => {
                let base = words[1] as usize;
                for (offset, word) in words[2..].iter_mut().enumerate() {
                    *word = registers[base + offset];
                }
            }
            OPCODE_WRITE => {
                let base = words[1] as usize;
                for (offset, word) in words[2..].iter().enumerate() {
                    registers[base + offset] = *word;
                }
            }
            OPCODE_BIT_MODIFY => {
                let address = words[1] as usize;
                let mask = words[2];
                let value = words[3];
                registers[address] = (registers[address] & !mask) | (value & mask);
                // A transmit request "completes" immediately unless a test
                // asked for a stuck transmission.
                if address == TXB0CTRL as usize
                    && mask & TXREQ != 0
                    && value & TXREQ != 0
                    && self.auto_complete_tx.get()
                {
                    registers[address] &= !TXREQ;
                }
            }
            OPCODE_READ_STATUS => {
                words[1] = registers[CANINTF as usize] & 0x03;
            }
            _ => {}
        }
        Ok(words)
    }
}

#[derive(Clone)]
pub(crate) struct MockChipSelect {
    level_low: Rc<Cell<bool>>,
}

impl MockChipSelect {
    pub(crate) fn new() -> Self {
        Self {
            level_low: Rc::new(Cell::new(false)),
        }
    }

    pub(crate) fn is_low(&self) -> bool {
        self.level_low.get()
    }
}

impl OutputPin for MockChipSelect {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level_low.set(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level_low.set(false);
        Ok(())
    }
}
