// SPDX-License-Identifier: Apache-2.0
//! Calibration data handling for the MLX90640.
//!
//! The camera's EEPROM is a sequence of 16-bit words with calibration
//! constants packed into sub-word bit fields. Instead of open-coding shifts
//! and masks at every use site, each constant is described by a [`Field`]
//! (word index, LSB offset, bit width; per-pixel fields add a base word and
//! packing density) and decoded through one generic extraction routine.

use crate::util::i16_from_bits;

use super::{HEIGHT, NUM_PAGES, NUM_PIXELS, NUM_RANGES, NUM_TGC, WIDTH};
use crate::error::LibraryError;

/// The number of 16-bit words in the EEPROM image.
pub const EEPROM_WORDS: usize = 0x680 / 2;

/// The first EEPROM word holding per-pixel calibration data.
const PIXEL_DATA_BASE: u16 = 0x40;

/// Location of a calibration constant within the EEPROM image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Field {
    /// A single value at a fixed word, LSB offset and width.
    Scalar { word: u16, lsb: u8, width: u8 },

    /// A per-index value. `per_word` values are packed into each word
    /// starting at `base`, each `width` bits wide, the first at `lsb`.
    Indexed {
        base: u16,
        per_word: u16,
        lsb: u8,
        width: u8,
    },
}

impl Field {
    /// Resolve a field (at `index`, for indexed fields) to its word index,
    /// LSB offset and width.
    pub(crate) fn location(&self, index: usize) -> (usize, u8, u8) {
        match self {
            Field::Scalar { word, lsb, width } => (*word as usize, *lsb, *width),
            Field::Indexed {
                base,
                per_word,
                lsb,
                width,
            } => {
                let word = *base as usize + index / *per_word as usize;
                let slot = (index % *per_word as usize) as u8;
                (word, lsb + slot * width, *width)
            }
        }
    }

    /// Extract the raw (unsigned, unscaled) value of this field.
    pub(crate) fn extract(&self, eeprom: &[u16], index: usize) -> u16 {
        let (word, lsb, width) = self.location(index);
        let mask = ((1u32 << width) - 1) as u16;
        (eeprom[word] >> lsb) & mask
    }
}

pub(crate) const DEVICE_ID: [Field; 3] = [
    Field::Scalar { word: 0x07, lsb: 0, width: 16 },
    Field::Scalar { word: 0x08, lsb: 0, width: 16 },
    Field::Scalar { word: 0x09, lsb: 0, width: 16 },
];

// Supply voltage constants.
pub(crate) const VDD_25: Field = Field::Scalar { word: 0x33, lsb: 0, width: 8 };
pub(crate) const K_VDD: Field = Field::Scalar { word: 0x33, lsb: 8, width: 8 };
pub(crate) const RESOLUTION_CONTROL: Field = Field::Scalar { word: 0x38, lsb: 12, width: 2 };

// Ambient temperature (PTAT) constants.
pub(crate) const PTAT_25: Field = Field::Scalar { word: 0x31, lsb: 0, width: 16 };
pub(crate) const K_V_PTAT: Field = Field::Scalar { word: 0x32, lsb: 10, width: 6 };
pub(crate) const K_T_PTAT: Field = Field::Scalar { word: 0x32, lsb: 0, width: 10 };
pub(crate) const ALPHA_PTAT: Field = Field::Scalar { word: 0x10, lsb: 12, width: 4 };

pub(crate) const GAIN: Field = Field::Scalar { word: 0x30, lsb: 0, width: 16 };

// Per-pixel offset references, assembled from an average, row and column
// coefficients, and a per-pixel remainder.
pub(crate) const PIX_OS_AVERAGE: Field = Field::Scalar { word: 0x11, lsb: 0, width: 16 };
pub(crate) const SCALE_OCC_REM: Field = Field::Scalar { word: 0x10, lsb: 0, width: 4 };
pub(crate) const SCALE_OCC_COL: Field = Field::Scalar { word: 0x10, lsb: 4, width: 4 };
pub(crate) const SCALE_OCC_ROW: Field = Field::Scalar { word: 0x10, lsb: 8, width: 4 };
pub(crate) const OCC_ROW: Field = Field::Indexed { base: 0x12, per_word: 4, lsb: 0, width: 4 };
pub(crate) const OCC_COL: Field = Field::Indexed { base: 0x18, per_word: 4, lsb: 0, width: 4 };
pub(crate) const PIXEL_OFFSET: Field =
    Field::Indexed { base: PIXEL_DATA_BASE, per_word: 1, lsb: 10, width: 6 };

// Per-pixel sensitivity, same assembly scheme as the offsets.
pub(crate) const PIX_SENS_AVERAGE: Field = Field::Scalar { word: 0x21, lsb: 0, width: 16 };
pub(crate) const SCALE_ACC_REM: Field = Field::Scalar { word: 0x20, lsb: 0, width: 4 };
pub(crate) const SCALE_ACC_COL: Field = Field::Scalar { word: 0x20, lsb: 4, width: 4 };
pub(crate) const SCALE_ACC_ROW: Field = Field::Scalar { word: 0x20, lsb: 8, width: 4 };
pub(crate) const ALPHA_SCALE: Field = Field::Scalar { word: 0x20, lsb: 12, width: 4 };
pub(crate) const ACC_ROW: Field = Field::Indexed { base: 0x22, per_word: 4, lsb: 0, width: 4 };
pub(crate) const ACC_COL: Field = Field::Indexed { base: 0x28, per_word: 4, lsb: 0, width: 4 };
pub(crate) const PIXEL_ALPHA: Field =
    Field::Indexed { base: PIXEL_DATA_BASE, per_word: 1, lsb: 4, width: 6 };

// Offset dependence on ambient temperature.
pub(crate) const K_TA_SCALE_1: Field = Field::Scalar { word: 0x38, lsb: 4, width: 4 };
pub(crate) const K_TA_SCALE_2: Field = Field::Scalar { word: 0x38, lsb: 0, width: 4 };
pub(crate) const K_TA_AVG_RO_CO: Field = Field::Scalar { word: 0x36, lsb: 8, width: 8 };
pub(crate) const K_TA_AVG_RE_CO: Field = Field::Scalar { word: 0x36, lsb: 0, width: 8 };
pub(crate) const K_TA_AVG_RO_CE: Field = Field::Scalar { word: 0x37, lsb: 8, width: 8 };
pub(crate) const K_TA_AVG_RE_CE: Field = Field::Scalar { word: 0x37, lsb: 0, width: 8 };
pub(crate) const PIXEL_K_TA: Field =
    Field::Indexed { base: PIXEL_DATA_BASE, per_word: 1, lsb: 1, width: 3 };

// Offset dependence on supply voltage.
pub(crate) const K_V_SCALE: Field = Field::Scalar { word: 0x38, lsb: 8, width: 4 };
pub(crate) const K_V_AVG_RO_CO: Field = Field::Scalar { word: 0x34, lsb: 12, width: 4 };
pub(crate) const K_V_AVG_RE_CO: Field = Field::Scalar { word: 0x34, lsb: 8, width: 4 };
pub(crate) const K_V_AVG_RO_CE: Field = Field::Scalar { word: 0x34, lsb: 4, width: 4 };
pub(crate) const K_V_AVG_RE_CE: Field = Field::Scalar { word: 0x34, lsb: 0, width: 4 };

// Cyclic (compensation) pixel channels.
pub(crate) const TGC: Field = Field::Scalar { word: 0x3C, lsb: 0, width: 8 };
pub(crate) const ALPHA_CP_P0: Field = Field::Scalar { word: 0x39, lsb: 0, width: 10 };
pub(crate) const ALPHA_CP_P1_RATIO: Field = Field::Scalar { word: 0x39, lsb: 10, width: 6 };
pub(crate) const OFFSET_CP_P0: Field = Field::Scalar { word: 0x3A, lsb: 0, width: 10 };
pub(crate) const OFFSET_CP_P1_DELTA: Field = Field::Scalar { word: 0x3A, lsb: 10, width: 6 };
pub(crate) const K_TA_CP: Field = Field::Scalar { word: 0x3B, lsb: 0, width: 8 };
pub(crate) const K_V_CP: Field = Field::Scalar { word: 0x3B, lsb: 8, width: 8 };

// Sensitivity drift vs. ambient and object temperature.
pub(crate) const K_S_TA: Field = Field::Scalar { word: 0x3C, lsb: 8, width: 8 };
pub(crate) const K_S_TO_R2: Field = Field::Scalar { word: 0x3D, lsb: 8, width: 8 };
pub(crate) const SCALE_K_S_TO: Field = Field::Scalar { word: 0x3F, lsb: 0, width: 4 };

// Calibration-range corner temperatures.
pub(crate) const CT1: Field = Field::Scalar { word: 0x3F, lsb: 4, width: 4 };
pub(crate) const CT2: Field = Field::Scalar { word: 0x3F, lsb: 8, width: 4 };
pub(crate) const TEMP_STEP: Field = Field::Scalar { word: 0x3F, lsb: 12, width: 2 };

/// One calibration range's ambient-temperature bounds and reference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationRange {
    pub ta_min: f32,
    pub ta_max: f32,
    /// The ambient reference the offset compensation is relative to.
    pub ta_ref: f32,
}

/// Calibration constants decoded from the EEPROM image.
///
/// Built once at startup and never mutated afterwards. The per-pixel tables
/// are flattened: the offset, K<sub>Ta</sub> and K<sub>V</sub> tables hold
/// `NUM_RANGES * NUM_PIXELS` entries addressed as `range * NUM_PIXELS +
/// pixel`, while the sensitivity table is shared across ranges and holds
/// `NUM_PIXELS` entries.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationParameters {
    pub(crate) device_id: [u16; 3],

    pub(crate) v_dd_25: f32,
    pub(crate) k_v_dd: f32,
    pub(crate) v_dd_0: f32,
    pub(crate) resolution: u8,

    pub(crate) v_ptat_25: f32,
    pub(crate) k_v_ptat: f32,
    pub(crate) k_t_ptat: f32,
    pub(crate) alpha_ptat: f32,

    pub(crate) gain_ref: f32,

    pub(crate) k_s_ta: f32,
    pub(crate) ta_ref_alpha: f32,
    pub(crate) k_s_to: f32,
    pub(crate) to_ref_alpha: f32,

    pub(crate) ranges: [CalibrationRange; NUM_RANGES],

    /// `NUM_RANGES * NUM_PIXELS` offset references.
    pub(crate) offset: Box<[f32]>,
    /// `NUM_RANGES * NUM_PIXELS` ambient-temperature coefficients.
    pub(crate) k_ta: Box<[f32]>,
    /// `NUM_RANGES * NUM_PIXELS` supply-voltage coefficients.
    pub(crate) k_v: Box<[f32]>,
    /// `NUM_PIXELS` sensitivities, shared by all ranges.
    pub(crate) alpha: Box<[f32]>,

    /// Per-channel cyclic-pixel weights. Channel 0 is unused on this device.
    pub(crate) tgc: [f32; NUM_TGC],
    pub(crate) alpha_tgc: [[f32; NUM_TGC]; NUM_PAGES],
    pub(crate) offset_tgc: [[[f32; NUM_TGC]; NUM_PAGES]; NUM_RANGES],
    pub(crate) k_ta_tgc: [[[f32; NUM_TGC]; NUM_PAGES]; NUM_RANGES],
    pub(crate) k_v_tgc: [[[f32; NUM_TGC]; NUM_PAGES]; NUM_RANGES],

    /// Pixels whose EEPROM word is zero (dead on arrival).
    pub(crate) broken_pixels: Vec<usize>,
    /// Pixels flagged by the factory as deviating from spec.
    pub(crate) outlier_pixels: Vec<usize>,
}

impl CalibrationParameters {
    /// Decode calibration constants from a full EEPROM image.
    pub fn from_words(eeprom: &[u16]) -> Result<Self, LibraryError> {
        if eeprom.len() < EEPROM_WORDS {
            return Err(LibraryError::Other(
                "Buffer is too short to be a full EEPROM image",
            ));
        }
        let mut params = Self::neutral();

        params.device_id = [
            DEVICE_ID[0].extract(eeprom, 0),
            DEVICE_ID[1].extract(eeprom, 0),
            DEVICE_ID[2].extract(eeprom, 0),
        ];

        params.v_dd_25 = ((VDD_25.extract(eeprom, 0) as i32 - 256) * (1 << 5) - (1 << 13)) as f32;
        params.k_v_dd = ((K_VDD.extract(eeprom, 0) as u8 as i8) as i32 * (1 << 5)) as f32;
        params.resolution = RESOLUTION_CONTROL.extract(eeprom, 0) as u8;

        params.v_ptat_25 = PTAT_25.extract(eeprom, 0) as i16 as f32;
        params.k_v_ptat = i16_from_bits(K_V_PTAT.extract(eeprom, 0), 6) as f32 / (1 << 12) as f32;
        params.k_t_ptat = i16_from_bits(K_T_PTAT.extract(eeprom, 0), 10) as f32 / (1 << 3) as f32;
        params.alpha_ptat = ALPHA_PTAT.extract(eeprom, 0) as f32 / 4.0 + 8.0;

        params.gain_ref = GAIN.extract(eeprom, 0) as i16 as f32;

        // Offset references: average + row + column + per-pixel remainder.
        let pix_os_average = PIX_OS_AVERAGE.extract(eeprom, 0) as i16 as i32;
        let scale_occ_rem = 1i32 << SCALE_OCC_REM.extract(eeprom, 0);
        let scale_occ_col = 1i32 << SCALE_OCC_COL.extract(eeprom, 0);
        let scale_occ_row = 1i32 << SCALE_OCC_ROW.extract(eeprom, 0);
        let mut occ_row = [0i32; HEIGHT];
        for (r, occ) in occ_row.iter_mut().enumerate() {
            *occ = i16_from_bits(OCC_ROW.extract(eeprom, r), 4) as i32 * scale_occ_row;
        }
        let mut occ_col = [0i32; WIDTH];
        for (c, occ) in occ_col.iter_mut().enumerate() {
            *occ = i16_from_bits(OCC_COL.extract(eeprom, c), 4) as i32 * scale_occ_col;
        }
        for r in 0..HEIGHT {
            for c in 0..WIDTH {
                let idx = r * WIDTH + c;
                let remainder = i16_from_bits(PIXEL_OFFSET.extract(eeprom, idx), 6) as i32;
                let offset =
                    (pix_os_average + occ_row[r] + occ_col[c] + remainder * scale_occ_rem) as f32;
                for range in 0..NUM_RANGES {
                    params.offset[range * NUM_PIXELS + idx] = offset;
                }
            }
        }

        // Sensitivities, same assembly scheme with its own scales.
        let alpha_scale_exp = ALPHA_SCALE.extract(eeprom, 0);
        let alpha_scale = (1u64 << alpha_scale_exp) as f32 * (1u64 << 30) as f32;
        let pix_sens_average = PIX_SENS_AVERAGE.extract(eeprom, 0) as i16 as i32;
        let scale_acc_rem = 1i32 << SCALE_ACC_REM.extract(eeprom, 0);
        let scale_acc_col = 1i32 << SCALE_ACC_COL.extract(eeprom, 0);
        let scale_acc_row = 1i32 << SCALE_ACC_ROW.extract(eeprom, 0);
        let mut acc_row = [0i32; HEIGHT];
        for (r, acc) in acc_row.iter_mut().enumerate() {
            *acc = i16_from_bits(ACC_ROW.extract(eeprom, r), 4) as i32 * scale_acc_row;
        }
        let mut acc_col = [0i32; WIDTH];
        for (c, acc) in acc_col.iter_mut().enumerate() {
            *acc = i16_from_bits(ACC_COL.extract(eeprom, c), 4) as i32 * scale_acc_col;
        }
        for r in 0..HEIGHT {
            for c in 0..WIDTH {
                let idx = r * WIDTH + c;
                let remainder = i16_from_bits(PIXEL_ALPHA.extract(eeprom, idx), 6) as i32;
                params.alpha[idx] = (pix_sens_average + acc_row[r] + acc_col[c]
                    + remainder * scale_acc_rem) as f32
                    / alpha_scale;
            }
        }

        // K_Ta: a per-pixel remainder around one of four averages chosen by
        // row/column parity.
        let k_ta_scale_1 = (1u32 << (K_TA_SCALE_1.extract(eeprom, 0) + 8)) as f32;
        let k_ta_scale_2 = 1i32 << K_TA_SCALE_2.extract(eeprom, 0);
        let k_ta_avg = [
            [
                K_TA_AVG_RO_CO.extract(eeprom, 0) as u8 as i8 as i32,
                K_TA_AVG_RO_CE.extract(eeprom, 0) as u8 as i8 as i32,
            ],
            [
                K_TA_AVG_RE_CO.extract(eeprom, 0) as u8 as i8 as i32,
                K_TA_AVG_RE_CE.extract(eeprom, 0) as u8 as i8 as i32,
            ],
        ];
        for r in 0..HEIGHT {
            for c in 0..WIDTH {
                let idx = r * WIDTH + c;
                let remainder = i16_from_bits(PIXEL_K_TA.extract(eeprom, idx), 3) as i32;
                let k_ta = (remainder * k_ta_scale_2 + k_ta_avg[r % 2][c % 2]) as f32 / k_ta_scale_1;
                for range in 0..NUM_RANGES {
                    params.k_ta[range * NUM_PIXELS + idx] = k_ta;
                }
            }
        }

        // K_V has no per-pixel remainder, only the four parity averages.
        let k_v_scale = (1u32 << K_V_SCALE.extract(eeprom, 0)) as f32;
        let k_v_avg = [
            [
                i16_from_bits(K_V_AVG_RO_CO.extract(eeprom, 0), 4) as f32 / k_v_scale,
                i16_from_bits(K_V_AVG_RO_CE.extract(eeprom, 0), 4) as f32 / k_v_scale,
            ],
            [
                i16_from_bits(K_V_AVG_RE_CO.extract(eeprom, 0), 4) as f32 / k_v_scale,
                i16_from_bits(K_V_AVG_RE_CE.extract(eeprom, 0), 4) as f32 / k_v_scale,
            ],
        ];
        for r in 0..HEIGHT {
            for c in 0..WIDTH {
                let idx = r * WIDTH + c;
                for range in 0..NUM_RANGES {
                    params.k_v[range * NUM_PIXELS + idx] = k_v_avg[r % 2][c % 2];
                }
            }
        }

        // Calibration-range bounds. Ranges 0 and 1 are fixed; 2 and 3 are
        // delimited by the corner temperatures.
        let temp_step = TEMP_STEP.extract(eeprom, 0) as f32 * 5.0;
        let ct1 = CT1.extract(eeprom, 0) as f32 * temp_step;
        let ct2 = CT2.extract(eeprom, 0) as f32 * temp_step;
        params.ranges = [
            CalibrationRange { ta_min: -200.0, ta_max: 1000.0, ta_ref: 25.0 },
            CalibrationRange { ta_min: -200.0, ta_max: 0.0, ta_ref: 25.0 },
            CalibrationRange { ta_min: 60.0, ta_max: ct1, ta_ref: 25.0 },
            CalibrationRange { ta_min: ct1, ta_max: ct2, ta_ref: 25.0 },
        ];

        // Cyclic-pixel (TGC) channels. Channel 0 is unused on this device.
        let alpha_scale_cp = (1u64 << alpha_scale_exp) as f32 * (1u64 << 27) as f32;
        params.tgc = [
            0.0,
            (TGC.extract(eeprom, 0) as u8 as i8) as f32 / (1 << 5) as f32,
        ];
        let alpha_cp_p0 = ALPHA_CP_P0.extract(eeprom, 0) as f32 / alpha_scale_cp;
        let alpha_cp_ratio = i16_from_bits(ALPHA_CP_P1_RATIO.extract(eeprom, 0), 6) as f32;
        params.alpha_tgc = [
            [1.0, alpha_cp_p0],
            [1.0, alpha_cp_p0 * (1.0 + alpha_cp_ratio / (1 << 7) as f32)],
        ];
        let offset_cp_p0 = i16_from_bits(OFFSET_CP_P0.extract(eeprom, 0), 10) as f32;
        let offset_cp_p1 =
            i16_from_bits(OFFSET_CP_P1_DELTA.extract(eeprom, 0), 6) as f32 + offset_cp_p0;
        let k_ta_cp = (K_TA_CP.extract(eeprom, 0) as u8 as i8) as f32 / k_ta_scale_1;
        let k_v_cp = (K_V_CP.extract(eeprom, 0) as u8 as i8) as f32 / k_v_scale;
        for range in 0..NUM_RANGES {
            params.offset_tgc[range] = [[0.0, offset_cp_p0], [0.0, offset_cp_p1]];
            params.k_ta_tgc[range] = [[0.0, k_ta_cp], [0.0, k_ta_cp]];
            params.k_v_tgc[range] = [[0.0, k_v_cp], [0.0, k_v_cp]];
        }

        params.k_s_ta = (K_S_TA.extract(eeprom, 0) as u8 as i8) as f32 / (1 << 13) as f32;
        let scale_k_s_to = (1u32 << (SCALE_K_S_TO.extract(eeprom, 0) + 8)) as f32;
        // Only the basic range's coefficient is used by the compensation.
        params.k_s_to = (K_S_TO_R2.extract(eeprom, 0) as u8 as i8) as f32 / scale_k_s_to;

        // Bad-pixel bookkeeping. A zeroed pixel word is a dead pixel, bit 0
        // flags a factory-marked outlier.
        for idx in 0..NUM_PIXELS {
            let word = eeprom[PIXEL_DATA_BASE as usize + idx];
            if word == 0 {
                params.broken_pixels.push(idx);
            } else if word & 0x0001 != 0 {
                params.outlier_pixels.push(idx);
            }
        }

        Ok(params)
    }

    /// Neutral parameters: unity sensitivity, zero offsets, disabled cyclic
    /// channels, and nominal device-wide constants.
    ///
    /// Used as the starting point for decoding and as a fixture for tests
    /// that need a calibration with no per-pixel structure.
    pub fn neutral() -> Self {
        Self {
            device_id: [0; 3],
            v_dd_25: -19474.0,
            k_v_dd: -4690.0,
            v_dd_0: 3.3,
            resolution: 3,
            v_ptat_25: 10974.0,
            k_v_ptat: 0.0113,
            k_t_ptat: 35.74,
            alpha_ptat: 11.2,
            gain_ref: 5471.0,
            k_s_ta: 0.001,
            ta_ref_alpha: 25.0,
            k_s_to: 0.0004,
            to_ref_alpha: 0.0,
            ranges: [
                CalibrationRange { ta_min: -40.0, ta_max: 70.0, ta_ref: 25.0 },
                CalibrationRange { ta_min: 70.0, ta_max: 110.0, ta_ref: 90.0 },
                CalibrationRange { ta_min: 110.0, ta_max: 150.0, ta_ref: 130.0 },
                CalibrationRange { ta_min: 900.0, ta_max: 800.0, ta_ref: 900.0 },
            ],
            offset: vec![0.0; NUM_RANGES * NUM_PIXELS].into_boxed_slice(),
            k_ta: vec![0.0; NUM_RANGES * NUM_PIXELS].into_boxed_slice(),
            k_v: vec![0.0; NUM_RANGES * NUM_PIXELS].into_boxed_slice(),
            alpha: vec![1.0; NUM_PIXELS].into_boxed_slice(),
            tgc: [0.0; NUM_TGC],
            alpha_tgc: [[1.0; NUM_TGC]; NUM_PAGES],
            offset_tgc: [[[0.0; NUM_TGC]; NUM_PAGES]; NUM_RANGES],
            k_ta_tgc: [[[0.0; NUM_TGC]; NUM_PAGES]; NUM_RANGES],
            k_v_tgc: [[[0.0; NUM_TGC]; NUM_PAGES]; NUM_RANGES],
            broken_pixels: Vec::new(),
            outlier_pixels: Vec::new(),
        }
    }

    /// The two 32-bit halves plus remainder of the factory device id.
    pub fn device_id(&self) -> [u16; 3] {
        self.device_id
    }

    pub fn broken_pixels(&self) -> &[usize] {
        &self.broken_pixels
    }

    pub fn outlier_pixels(&self) -> &[usize] {
        &self.outlier_pixels
    }

    #[inline]
    pub(crate) fn offset(&self, range: usize, pixel: usize) -> f32 {
        self.offset[range * NUM_PIXELS + pixel]
    }

    #[inline]
    pub(crate) fn k_ta(&self, range: usize, pixel: usize) -> f32 {
        self.k_ta[range * NUM_PIXELS + pixel]
    }

    #[inline]
    pub(crate) fn k_v(&self, range: usize, pixel: usize) -> f32 {
        self.k_v[range * NUM_PIXELS + pixel]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::eeprom_data::{set_field, synthetic_eeprom};

    #[test]
    fn field_locations() {
        // Packed four to a word: index 5 lands in the second word, second slot.
        assert_eq!(OCC_ROW.location(5), (0x13, 4, 4));
        assert_eq!(OCC_COL.location(0), (0x18, 0, 4));
        // One per word at a fixed offset.
        assert_eq!(PIXEL_OFFSET.location(767), (0x40 + 767, 10, 6));
        assert_eq!(K_VDD.location(0), (0x33, 8, 8));
    }

    #[test]
    fn extract_masks_neighbors() {
        let mut eeprom = [0u16; EEPROM_WORDS];
        eeprom[0x33] = 0xBEEF;
        assert_eq!(VDD_25.extract(&eeprom, 0), 0xEF);
        assert_eq!(K_VDD.extract(&eeprom, 0), 0xBE);
    }

    #[test]
    fn decode_device_constants() {
        let mut eeprom = synthetic_eeprom();
        // V_DD_25 code 0x9A: (0x9A - 256) * 32 - 8192 = -11456
        set_field(&mut eeprom, VDD_25, 0, 0x9A);
        // K_V_DD code 0x9D: as i8 = -99, * 32 = -3168
        set_field(&mut eeprom, K_VDD, 0, 0x9D);
        set_field(&mut eeprom, PTAT_25, 0, 12345);
        // 6-bit signed 0x2A = -22, / 4096
        set_field(&mut eeprom, K_V_PTAT, 0, 0x2A);
        // 10-bit signed 0x22A = -470, / 8
        set_field(&mut eeprom, K_T_PTAT, 0, 0x22A);
        // alpha_ptat code 9: 9 / 4 + 8 = 10.25
        set_field(&mut eeprom, ALPHA_PTAT, 0, 9);
        set_field(&mut eeprom, GAIN, 0, 0xE000); // as i16 = -8192

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        assert_eq!(params.v_dd_25, -11456.0);
        assert_eq!(params.k_v_dd, -3168.0);
        assert_eq!(params.v_ptat_25, 12345.0);
        assert_eq!(params.k_v_ptat, -22.0 / 4096.0);
        assert_eq!(params.k_t_ptat, -470.0 / 8.0);
        assert_eq!(params.alpha_ptat, 10.25);
        assert_eq!(params.gain_ref, -8192.0);
    }

    #[test]
    fn decode_pixel_offsets() {
        let mut eeprom = synthetic_eeprom();
        set_field(&mut eeprom, PIX_OS_AVERAGE, 0, 100);
        set_field(&mut eeprom, SCALE_OCC_ROW, 0, 2);
        set_field(&mut eeprom, SCALE_OCC_COL, 0, 1);
        set_field(&mut eeprom, SCALE_OCC_REM, 0, 3);
        // Row 1 coefficient -2, column 3 coefficient 5, pixel remainder -7.
        set_field(&mut eeprom, OCC_ROW, 1, 0x0E);
        set_field(&mut eeprom, OCC_COL, 3, 5);
        let idx = WIDTH + 3;
        set_field(&mut eeprom, PIXEL_OFFSET, idx, 0x39);

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        // 100 + (-2 << 2) + (5 << 1) + (-7 << 3) = 100 - 8 + 10 - 56 = 46
        assert_eq!(params.offset(0, idx), 46.0);
        // Every range shares the same per-pixel data.
        for range in 1..NUM_RANGES {
            assert_eq!(params.offset(range, idx), 46.0);
        }
        // An untouched pixel only carries the average.
        assert_eq!(params.offset(0, 0), 100.0);
    }

    #[test]
    fn decode_sensitivity() {
        let mut eeprom = synthetic_eeprom();
        set_field(&mut eeprom, ALPHA_SCALE, 0, 2);
        set_field(&mut eeprom, PIX_SENS_AVERAGE, 0, 4000);
        set_field(&mut eeprom, SCALE_ACC_REM, 0, 1);
        set_field(&mut eeprom, ACC_ROW, 0, 1);
        set_field(&mut eeprom, ACC_COL, 0, 1);
        set_field(&mut eeprom, PIXEL_ALPHA, 0, 2);

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        // Scales default to 1 << 0 except the ones set above.
        let expected = (4000.0 + 1.0 + 1.0 + 2.0 * 2.0) / ((1u64 << 32) as f32);
        assert_eq!(params.alpha[0], expected);
    }

    #[test]
    fn decode_k_ta_parity_grid() {
        let mut eeprom = synthetic_eeprom();
        set_field(&mut eeprom, K_TA_SCALE_1, 0, 1); // scale1 = 2^9 = 512
        set_field(&mut eeprom, K_TA_SCALE_2, 0, 2); // scale2 = 4
        set_field(&mut eeprom, K_TA_AVG_RO_CO, 0, 0x40); // 64
        set_field(&mut eeprom, K_TA_AVG_RE_CE, 0, 0xC0); // -64
        // Pixel (0, 0): even row, even column in 0-indexed terms.
        set_field(&mut eeprom, PIXEL_K_TA, 0, 0x7); // 3-bit signed -1

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        assert_eq!(params.k_ta(0, 0), (-1.0 * 4.0 + 64.0) / 512.0);
        // Pixel (1, 1) picks the odd/odd average.
        assert_eq!(params.k_ta(0, WIDTH + 1), -64.0 / 512.0);
    }

    #[test]
    fn decode_cyclic_channels() {
        let mut eeprom = synthetic_eeprom();
        set_field(&mut eeprom, ALPHA_SCALE, 0, 1);
        set_field(&mut eeprom, TGC, 0, 0xF0); // -16 / 32 = -0.5
        set_field(&mut eeprom, ALPHA_CP_P0, 0, 512);
        set_field(&mut eeprom, ALPHA_CP_P1_RATIO, 0, 0x20); // -32 / 128 = -0.25
        set_field(&mut eeprom, OFFSET_CP_P0, 0, 0x3FF); // 10-bit signed -1
        set_field(&mut eeprom, OFFSET_CP_P1_DELTA, 0, 6);
        set_field(&mut eeprom, K_V_SCALE, 0, 3);
        set_field(&mut eeprom, K_V_CP, 0, 0x10); // 16 / 8 = 2.0
        set_field(&mut eeprom, K_TA_SCALE_1, 0, 0); // 2^8
        set_field(&mut eeprom, K_TA_CP, 0, 0x80); // -128 / 256 = -0.5

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        assert_eq!(params.tgc[1], -0.5);
        let alpha_scale_cp = 2.0 * (1u64 << 27) as f32;
        assert_eq!(params.alpha_tgc[0][1], 512.0 / alpha_scale_cp);
        assert_eq!(params.alpha_tgc[1][1], params.alpha_tgc[0][1] * 0.75);
        assert_eq!(params.offset_tgc[0][0][1], -1.0);
        assert_eq!(params.offset_tgc[0][1][1], 5.0);
        assert_eq!(params.k_v_tgc[0][0][1], 2.0);
        assert_eq!(params.k_ta_tgc[0][1][1], -0.5);
        // Cyclic parameters repeat across all calibration ranges.
        assert_eq!(params.offset_tgc[3], params.offset_tgc[0]);
    }

    #[test]
    fn decode_range_bounds() {
        let mut eeprom = synthetic_eeprom();
        set_field(&mut eeprom, TEMP_STEP, 0, 2); // step = 10
        set_field(&mut eeprom, CT1, 0, 12); // 120
        set_field(&mut eeprom, CT2, 0, 15); // 150

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        assert_eq!(params.ranges[2].ta_min, 60.0);
        assert_eq!(params.ranges[2].ta_max, 120.0);
        assert_eq!(params.ranges[3].ta_min, 120.0);
        assert_eq!(params.ranges[3].ta_max, 150.0);
        assert_eq!(params.ranges[0].ta_max, 1000.0);
    }

    #[test]
    fn bad_pixel_extraction() {
        let mut eeprom = synthetic_eeprom();
        // synthetic_eeprom fills the pixel words with a non-zero pattern;
        // zero out one pixel and flag another as an outlier.
        eeprom[0x40 + 5] = 0;
        eeprom[0x40 + 9] |= 0x0001;

        let params = CalibrationParameters::from_words(&eeprom).unwrap();
        assert_eq!(params.broken_pixels(), &[5]);
        assert_eq!(params.outlier_pixels(), &[9]);
    }

    #[test]
    fn short_buffer_rejected() {
        let eeprom = [0u16; 16];
        assert!(CalibrationParameters::from_words(&eeprom).is_err());
    }
}
