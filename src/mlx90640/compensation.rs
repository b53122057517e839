// SPDX-License-Identifier: Apache-2.0
//! Conversion of raw frames into per-pixel temperatures.
//!
//! The pipeline per frame: supply-voltage deviation from the voltage
//! calibration reference, ambient temperature from the PTAT telemetry words,
//! selection of the calibration range containing the ambient temperature,
//! gain-drift compensation from the gain telemetry word, the cyclic-pixel
//! correction for each page, and finally the two-pass Stefan-Boltzmann
//! conversion for each of the 768 pixels. The math follows the device
//! datasheet; the values are factory constants decoded in
//! [`eeprom`][super::eeprom].

use crate::error::LibraryError;

use super::eeprom::CalibrationParameters;
use super::{RawFrame, NUM_PAGES, NUM_PIXELS, NUM_TGC};

/// Lower bound for every computed temperature.
pub const ABSOLUTE_ZERO_CELSIUS: f32 = -273.15;

/// Output pixels are deci-Celsius for compact integer transport downstream.
const DECI_PER_DEGREE: f32 = 10.0;

/// Guard for divisors derived from bus-scale quantities (raw ADC counts).
const RAW_DIVISOR_GUARD: f32 = 1e-6;

/// Guard for divisors derived from calibration coefficients.
const COEFFICIENT_GUARD: f32 = 1e-12;

/// How many frames the cyclic-pixel low-pass averages over.
const CYCLIC_FILTER_DEPTH: i32 = 8;

// Indices into the 64-word auxiliary telemetry block (RAM 0x0700..0x0740).
const AUX_T_A_V_BE: usize = 0;
const AUX_CYCLIC_PAGE_0: [usize; NUM_TGC] = [8, 9];
const AUX_GAIN: usize = 10;
const AUX_T_A_PTAT: usize = 32;
const AUX_CYCLIC_PAGE_1: [usize; NUM_TGC] = [0x28, 0x29];
const AUX_V_DD: usize = 42;

/// A fully compensated frame.
///
/// Derived fresh from each [`RawFrame`]; not persisted beyond publication.
#[derive(Clone, Debug, PartialEq)]
pub struct CompensatedFrame {
    /// Pixel temperatures in deci-Celsius, row-major.
    pub pixels: [f32; NUM_PIXELS],

    /// Sensor ambient (die) temperature in Celsius.
    pub ambient: f32,
}

impl CompensatedFrame {
    /// The integer mean of the pixel temperatures, in deci-Celsius.
    ///
    /// Cheap to transport: it fits a 2-byte CAN payload.
    pub fn average_deci_celsius(&self) -> i16 {
        let total: f32 = self.pixels.iter().sum();
        (total / NUM_PIXELS as f32) as i16
    }
}

/// Fixed-depth low-pass over the raw cyclic-pixel values.
///
/// The cyclic pixels are noisy single measurements; the datasheet advises
/// averaging them across frames before using them as a correction.
#[derive(Clone, Debug)]
struct CyclicFilter {
    last: [[i32; NUM_PAGES]; NUM_TGC],
    primed: bool,
}

impl CyclicFilter {
    fn new() -> Self {
        Self {
            last: [[0; NUM_PAGES]; NUM_TGC],
            primed: false,
        }
    }

    /// Feed one raw cyclic value through the filter.
    ///
    /// The first observed frame seeds the filter and passes through
    /// unchanged.
    fn filter(&mut self, channel: usize, page: usize, value: i32) -> i32 {
        if !self.primed {
            self.last[channel][page] = value;
            value
        } else {
            let filtered =
                (self.last[channel][page] * (CYCLIC_FILTER_DEPTH - 1) + value) / CYCLIC_FILTER_DEPTH;
            self.last[channel][page] = filtered;
            filtered
        }
    }

    fn mark_primed(&mut self) {
        self.primed = true;
    }
}

/// Converts raw frames to temperatures using one camera's calibration.
///
/// Owns the calibration constants and the small amount of cross-frame state
/// (the cyclic-pixel filter). The [camera driver][super::Mlx90640] embeds
/// one of these; it is also usable standalone for offline processing of
/// recorded frames.
#[derive(Clone, Debug)]
pub struct FrameCompensator {
    calibration: CalibrationParameters,
    cyclic: CyclicFilter,
    emissivity: f32,
}

impl FrameCompensator {
    pub fn new(calibration: CalibrationParameters) -> Self {
        Self {
            calibration,
            cyclic: CyclicFilter::new(),
            emissivity: 1.0,
        }
    }

    pub fn calibration(&self) -> &CalibrationParameters {
        &self.calibration
    }

    pub fn emissivity(&self) -> f32 {
        self.emissivity
    }

    /// Override the emissivity used for the radiometric conversion.
    pub fn set_emissivity(&mut self, emissivity: f32) {
        self.emissivity = emissivity;
    }

    /// Compute per-pixel temperatures for one raw frame.
    pub fn compensate(&mut self, frame: &RawFrame) -> Result<CompensatedFrame, LibraryError> {
        let cal = &self.calibration;
        let aux = frame.aux();

        let v_dd = supply_voltage(cal, aux[AUX_V_DD])?;
        let delta_v = v_dd - cal.v_dd_0;
        let t_a = ambient_temperature(cal, aux[AUX_T_A_PTAT], aux[AUX_T_A_V_BE], delta_v)?;

        let range = select_range(cal, t_a);
        let delta_t_a = t_a - cal.ranges[range].ta_ref;

        let gain_word = aux[AUX_GAIN];
        if gain_word == 0 {
            return Err(LibraryError::Calibration(
                "gain telemetry word is zero, cannot compensate gain drift",
            ));
        }
        let gain_compensation = cal.gain_ref / f32::from(gain_word);

        let mut sensitivity_correction = 1.0 + cal.k_s_ta * (t_a - cal.ta_ref_alpha);
        if sensitivity_correction.abs() < COEFFICIENT_GUARD {
            return Err(LibraryError::Calibration(
                "ambient sensitivity correction collapsed to zero",
            ));
        }

        // Accumulate the cyclic-pixel correction for each page, summed over
        // both channels weighted by the per-channel coefficient.
        let mut cyclic_offset = [0f32; NUM_PAGES];
        let mut cyclic_alpha = [0f32; NUM_PAGES];
        for page in 0..NUM_PAGES {
            let aux_indices = if page == 0 {
                AUX_CYCLIC_PAGE_0
            } else {
                AUX_CYCLIC_PAGE_1
            };
            for channel in 0..NUM_TGC {
                if cal.tgc[channel].abs() <= COEFFICIENT_GUARD {
                    continue;
                }
                let raw = i32::from(aux[aux_indices[channel]]);
                let filtered = self.cyclic.filter(channel, page, raw);
                let gain_compensated = filtered as f32 * gain_compensation;
                let offset = cal.offset_tgc[range][page][channel]
                    * (1.0 + cal.k_ta_tgc[range][page][channel] * delta_t_a)
                    * (1.0 + cal.k_v_tgc[range][page][channel] * delta_v);
                cyclic_offset[page] += (gain_compensated - offset) * cal.tgc[channel];
                cyclic_alpha[page] += cal.alpha_tgc[page][channel] * cal.tgc[channel];
            }
        }
        self.cyclic.mark_primed();

        sensitivity_correction *= self.emissivity;
        if sensitivity_correction.abs() < COEFFICIENT_GUARD {
            return Err(LibraryError::Calibration(
                "emissivity-scaled sensitivity correction collapsed to zero",
            ));
        }

        let t_a_kelvin_4 = (t_a - ABSOLUTE_ZERO_CELSIUS).powi(4);

        let mut result = CompensatedFrame {
            pixels: [0f32; NUM_PIXELS],
            ambient: t_a,
        };
        for (index, (output, raw)) in result
            .pixels
            .iter_mut()
            .zip(frame.pixels().iter())
            .enumerate()
        {
            let page = frame.page_of(index);
            let gain_compensated = f32::from(*raw) * gain_compensation;
            let offset = cal.offset(range, index)
                * (1.0 + cal.k_ta(range, index) * delta_t_a)
                * (1.0 + cal.k_v(range, index) * delta_v);
            let compensated = gain_compensated - offset - cyclic_offset[page];

            let alpha = cal.alpha[index] - cyclic_alpha[page];
            let temperature = if alpha.abs() < COEFFICIENT_GUARD {
                ABSOLUTE_ZERO_CELSIUS
            } else {
                let radicand = compensated / sensitivity_correction / alpha + t_a_kelvin_4;
                if radicand < 0.0 {
                    ABSOLUTE_ZERO_CELSIUS
                } else {
                    // First pass gives an object-temperature estimate; the
                    // second pass re-applies the temperature-dependent
                    // sensitivity drift using that estimate.
                    let first_pass = radicand.powf(0.25) + ABSOLUTE_ZERO_CELSIUS;
                    let drift = 1.0 + cal.k_s_to * (first_pass - cal.to_ref_alpha);
                    let refined = compensated / sensitivity_correction / drift / alpha + t_a_kelvin_4;
                    if refined < 0.0 {
                        ABSOLUTE_ZERO_CELSIUS
                    } else {
                        refined.powf(0.25) + ABSOLUTE_ZERO_CELSIUS
                    }
                }
            };
            *output = DECI_PER_DEGREE * temperature;
        }
        Ok(result)
    }
}

/// Actual supply voltage from the V_DD telemetry word.
fn supply_voltage(cal: &CalibrationParameters, v_dd_raw: i16) -> Result<f32, LibraryError> {
    if cal.k_v_dd.abs() < RAW_DIVISOR_GUARD {
        return Err(LibraryError::Calibration("supply-voltage slope is too small"));
    }
    Ok(cal.v_dd_0 + (f32::from(v_dd_raw) - cal.v_dd_25) / cal.k_v_dd)
}

/// Ambient (die) temperature from the two PTAT telemetry words.
fn ambient_temperature(
    cal: &CalibrationParameters,
    t_a_ptat: i16,
    t_a_v_be: i16,
    delta_v: f32,
) -> Result<f32, LibraryError> {
    let denominator = f32::from(t_a_ptat) * cal.alpha_ptat + f32::from(t_a_v_be);
    if denominator.abs() < RAW_DIVISOR_GUARD {
        return Err(LibraryError::Calibration(
            "ambient-temperature ratio denominator is too small",
        ));
    }
    let v_ptat_virtual = f32::from(t_a_ptat) / denominator * (1u32 << 18) as f32;
    if cal.k_t_ptat.abs() < RAW_DIVISOR_GUARD {
        return Err(LibraryError::Calibration("PTAT temperature slope is too small"));
    }
    let supply_correction = 1.0 + delta_v * cal.k_v_ptat;
    if supply_correction.abs() < RAW_DIVISOR_GUARD {
        return Err(LibraryError::Calibration(
            "PTAT supply correction collapsed to zero",
        ));
    }
    Ok((v_ptat_virtual / supply_correction - cal.v_ptat_25) / cal.k_t_ptat + 25.0)
}

/// Pick the calibration range containing the ambient temperature, falling
/// back to the range whose bound is numerically closest.
fn select_range(cal: &CalibrationParameters, t_a: f32) -> usize {
    let mut closest = 0;
    let mut closest_distance = f32::INFINITY;
    for (index, range) in cal.ranges.iter().enumerate() {
        if range.ta_min <= t_a && t_a <= range.ta_max {
            return index;
        }
        let distance = (t_a - range.ta_min).abs().min((t_a - range.ta_max).abs());
        if distance < closest_distance {
            closest_distance = distance;
            closest = index;
        }
    }
    closest
}
