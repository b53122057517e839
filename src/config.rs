// SPDX-License-Identifier: Apache-2.0
//! Node-wide constants: CAN identifier allocation, task periods, bus
//! addresses, and retry/timeout budgets.

use std::time::Duration;

/// Base identifier for the average-tire-temperature message.
pub const TIRE_TEMP_ID_BASE: u16 = 0x100;

/// Base identifier for the linear-potentiometer (ADC) message.
pub const LINPOT_ID_BASE: u16 = 0x200;

/// Base identifier for the ride-height message.
pub const RIDE_HEIGHT_ID_BASE: u16 = 0x300;

/// Identifier stride between nodes: each corner node owns `base + 16 × id`.
pub const NODE_ID_STRIDE: u16 = 16;

/// The central controller broadcasts the active test session on this fixed
/// identifier as a 2-byte little-endian word.
pub const SESSION_BROADCAST_ID: u16 = 0x777;

/// The CAN identifier a node transmits a given message type on.
pub fn telemetry_id(base: u16, node_id: u8) -> u16 {
    base + NODE_ID_STRIDE * u16::from(node_id)
}

/// ADC channels carried by the linpot message.
pub const ADC_CHANNELS: usize = 3;

// Acquisition cadences.
pub const THERMAL_TASK_PERIOD: Duration = Duration::from_millis(125);
pub const RANGE_TASK_PERIOD: Duration = Duration::from_millis(50);
pub const ADC_TASK_PERIOD: Duration = Duration::from_millis(5);

// Bus cadences, deliberately decoupled from acquisition: a transmitted
// value may be stale by up to one acquisition period.
pub const TIRE_TEMP_TX_PERIOD: Duration = Duration::from_millis(125);
pub const LINPOT_TX_PERIOD: Duration = Duration::from_millis(20);
pub const RIDE_HEIGHT_TX_PERIOD: Duration = Duration::from_millis(50);
pub const CAN_RX_POLL_PERIOD: Duration = Duration::from_millis(1);
pub const SESSION_LOG_POLL_PERIOD: Duration = Duration::from_millis(2);

/// Sleep slice inside every cooperative poll loop.
pub const POLL_SLICE: Duration = Duration::from_millis(1);

/// How long a transmit waits for bus arbitration before aborting.
pub const CAN_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Retry budget for a single CAN-controller register transaction.
pub const SPI_MAX_RETRIES: u32 = 3;

/// Wall-clock ceiling for a single CAN-controller register transaction.
pub const SPI_OP_TIMEOUT: Duration = Duration::from_secs(1);

// Factory I²C addresses.
pub const MLX90640_ADDRESS: u8 = 0x33;
pub const VL53L0X_ADDRESS: u8 = 0x29;
pub const MAX11617_ADDRESS: u8 = 0x35;

/// Ride-height measurement variance, mm² (ranger noise is a few mm RMS).
pub const RANGE_MEASUREMENT_VARIANCE: f32 = 25.0;

/// White-acceleration variance for the ride-height filter, (mm/s²)².
///
/// Suspension travel sees accelerations on the order of a couple of m/s².
pub const RANGE_ACCEL_VARIANCE: f32 = 4.0e6;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn telemetry_ids_are_strided_per_node() {
        assert_eq!(telemetry_id(TIRE_TEMP_ID_BASE, 0), 0x100);
        assert_eq!(telemetry_id(TIRE_TEMP_ID_BASE, 2), 0x120);
        assert_eq!(telemetry_id(RIDE_HEIGHT_ID_BASE, 3), 0x330);
        // Four corners of message types never collide.
        for node_a in 0..4u8 {
            for node_b in 0..4u8 {
                if node_a == node_b {
                    continue;
                }
                for base in [TIRE_TEMP_ID_BASE, LINPOT_ID_BASE, RIDE_HEIGHT_ID_BASE] {
                    assert_ne!(telemetry_id(base, node_a), telemetry_id(base, node_b));
                }
            }
        }
    }
}
