// SPDX-License-Identifier: Apache-2.0
//! Process bootstrap for a telemetry node.
//!
//! Opens the buses, initializes whatever sensors answer, and spawns the
//! task threads. Every sensor is optional: an initialization failure is
//! logged and that task simply never starts, leaving the siblings
//! unaffected. Ctrl-C trips the shared cancellation token and the process
//! joins every task before exiting.

use std::convert::TryFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{I2cdev, Pin, Spidev};
use log::{error, info};

use wheeldaq::config::{
    telemetry_id, ADC_CHANNELS, ADC_TASK_PERIOD, CAN_RX_POLL_PERIOD, LINPOT_ID_BASE,
    LINPOT_TX_PERIOD, MAX11617_ADDRESS, MLX90640_ADDRESS, RANGE_ACCEL_VARIANCE,
    RANGE_MEASUREMENT_VARIANCE, RANGE_TASK_PERIOD, RIDE_HEIGHT_ID_BASE, RIDE_HEIGHT_TX_PERIOD,
    SESSION_BROADCAST_ID, SPI_MAX_RETRIES, SPI_OP_TIMEOUT, THERMAL_TASK_PERIOD,
    TIRE_TEMP_ID_BASE, TIRE_TEMP_TX_PERIOD, VL53L0X_ADDRESS,
};
use wheeldaq::kalman::RangeFilter;
use wheeldaq::max11617::Max11617;
use wheeldaq::mcp2515::{Mcp2515, MAX_STANDARD_ID};
use wheeldaq::mlx90640::{FrameRate, Mlx90640};
use wheeldaq::session::SessionLogger;
use wheeldaq::state::SharedSensorState;
use wheeldaq::tasks::{self, TelemetryMessage};
use wheeldaq::vl53l0x::Vl53l0x;

#[derive(Parser, Debug)]
#[command(version, about = "Corner telemetry node: thermal, ride height and linpot over CAN")]
struct Args {
    /// This node's position on the bus (0 to 3).
    #[arg(long, default_value_t = 0)]
    node_id: u8,

    /// I²C bus the thermal camera is on.
    #[arg(long, default_value = "/dev/i2c-1")]
    thermal_bus: String,

    /// I²C bus shared by the range sensor and the ADC.
    #[arg(long, default_value = "/dev/i2c-0")]
    aux_bus: String,

    /// SPI device of the CAN controller.
    #[arg(long, default_value = "/dev/spidev0.0")]
    can_spi: String,

    /// GPIO number of the CAN controller's chip select.
    #[arg(long, default_value_t = 5)]
    can_cs_pin: u64,

    /// Thermal camera capture rate in Hz.
    #[arg(long, default_value_t = 8.0)]
    frame_rate: f32,

    /// Directory session logs are written under.
    #[arg(long, default_value = "tests")]
    log_dir: PathBuf,

    /// Run the CAN controller in loopback mode for bench testing.
    #[arg(long)]
    loopback: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let frame_rate = FrameRate::try_from(args.frame_rate)
        .context("--frame-rate must be one of 0.5, 1, 2, 4, 8, 16, 32 or 64")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("installing the shutdown handler")?;
    }

    let state = Arc::new(SharedSensorState::new());
    let mut handles = Vec::new();

    match open_can(&args) {
        Ok(can) => {
            let can = Arc::new(Mutex::new(can));
            for (message, base, period) in [
                (
                    TelemetryMessage::TireTempAverage,
                    TIRE_TEMP_ID_BASE,
                    TIRE_TEMP_TX_PERIOD,
                ),
                (TelemetryMessage::Linpot, LINPOT_ID_BASE, LINPOT_TX_PERIOD),
                (
                    TelemetryMessage::RideHeight,
                    RIDE_HEIGHT_ID_BASE,
                    RIDE_HEIGHT_TX_PERIOD,
                ),
            ] {
                handles.push(tasks::spawn_can_tx_task(
                    Arc::clone(&can),
                    Arc::clone(&state),
                    message,
                    telemetry_id(base, args.node_id),
                    period,
                    Arc::clone(&shutdown),
                ));
            }
            handles.push(tasks::spawn_can_rx_task(
                can,
                Arc::clone(&state),
                SESSION_BROADCAST_ID,
                CAN_RX_POLL_PERIOD,
                Arc::clone(&shutdown),
            ));
        }
        Err(reason) => error!(
            "CAN controller unavailable, telemetry and session commands disabled: {:#}",
            reason
        ),
    }

    match init_thermal(&args, frame_rate) {
        Ok(camera) => handles.push(tasks::spawn_thermal_task(
            camera,
            Arc::clone(&state),
            THERMAL_TASK_PERIOD,
            Arc::clone(&shutdown),
        )),
        Err(reason) => error!("thermal camera unavailable: {:#}", reason),
    }

    match init_range(&args) {
        Ok(sensor) => handles.push(tasks::spawn_range_task(
            sensor,
            RangeFilter::new(RANGE_MEASUREMENT_VARIANCE, RANGE_ACCEL_VARIANCE),
            Arc::clone(&state),
            RANGE_TASK_PERIOD,
            Arc::clone(&shutdown),
        )),
        Err(reason) => error!("range sensor unavailable: {:#}", reason),
    }

    match init_adc(&args) {
        Ok(adc) => handles.push(tasks::spawn_adc_task(
            adc,
            Arc::clone(&state),
            ADC_TASK_PERIOD,
            Arc::clone(&shutdown),
        )),
        Err(reason) => error!("ADC unavailable: {:#}", reason),
    }

    handles.push(tasks::spawn_session_log_task(
        SessionLogger::new(&args.log_dir),
        Arc::clone(&state),
        Arc::clone(&shutdown),
    ));

    info!(
        "node {} running with {} tasks; logs under {}",
        args.node_id,
        handles.len(),
        args.log_dir.display()
    );
    for handle in handles {
        if handle.join().is_err() {
            error!("a task panicked during shutdown");
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Bring up the CAN controller: SPI configuration, reset and bit timing,
/// acceptance filtering for the session broadcast, and the on-bus mode.
fn open_can(args: &Args) -> Result<Mcp2515<Spidev, Pin>> {
    let mut spi =
        Spidev::open(&args.can_spi).with_context(|| format!("opening {}", args.can_spi))?;
    let options = SpidevOptions::new()
        .bits_per_word(8)
        .max_speed_hz(100_000)
        .mode(SpiModeFlags::SPI_MODE_0)
        .build();
    spi.configure(&options)
        .with_context(|| format!("configuring {}", args.can_spi))?;

    let cs = Pin::new(args.can_cs_pin);
    cs.export()
        .with_context(|| format!("exporting GPIO {}", args.can_cs_pin))?;
    cs.set_direction(Direction::High)
        .with_context(|| format!("driving GPIO {}", args.can_cs_pin))?;

    let mut can = Mcp2515::new(spi, cs, SPI_MAX_RETRIES, SPI_OP_TIMEOUT)?;
    can.set_config_mode()?;
    can.set_acceptance_mask(0, MAX_STANDARD_ID)?;
    can.set_acceptance_filter(0, SESSION_BROADCAST_ID)?;
    can.enable_filter_bank(0, true)?;
    if args.loopback {
        can.set_loopback_mode()?;
    } else {
        can.set_normal_mode()?;
    }
    Ok(can)
}

fn init_thermal(args: &Args, frame_rate: FrameRate) -> Result<Mlx90640<I2cdev>> {
    let bus =
        I2cdev::new(&args.thermal_bus).with_context(|| format!("opening {}", args.thermal_bus))?;
    Ok(Mlx90640::new(bus, MLX90640_ADDRESS, frame_rate)?)
}

fn init_range(args: &Args) -> Result<Vl53l0x<I2cdev>> {
    let bus = I2cdev::new(&args.aux_bus).with_context(|| format!("opening {}", args.aux_bus))?;
    Ok(Vl53l0x::new(bus, VL53L0X_ADDRESS)?)
}

fn init_adc(args: &Args) -> Result<Max11617<I2cdev>> {
    let bus = I2cdev::new(&args.aux_bus).with_context(|| format!("opening {}", args.aux_bus))?;
    Ok(Max11617::new(bus, MAX11617_ADDRESS, ADC_CHANNELS)?)
}
