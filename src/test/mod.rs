// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures for the unit tests: mock buses and synthetic EEPROM
//! images.

pub(crate) mod eeprom_data;
pub(crate) mod spi_mock;
