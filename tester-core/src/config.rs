//! Per-channel configuration: sampling cadence, edge-detection thresholds,
//! termination voltages, rest timing, and ADC calibration.
//!
//! The runtime-config loader lives outside this crate; it talks to us through
//! [`ChannelConfig::set`], which accepts the recognized key names verbatim as
//! they appear in the on-disk config.

use serde::Serialize;

/// Default sample period in milliseconds (20 Hz).
pub const DEFAULT_SAMPLE_PERIOD_MS: u32 = 50;
/// Default rest time between SoC phases, in seconds.
pub const DEFAULT_REST_S: u32 = 300;
/// Default ceiling on post-discharge rest before the run aborts, in seconds.
pub const DEFAULT_REST_MAX_S: u32 = 900;
/// Default number of discharge/charge cycles per SoC run.
pub const DEFAULT_MAX_CYCLES: u8 = 2;
/// Largest cycle count a run may be configured for (bounded cycle storage).
pub const MAX_CYCLES_LIMIT: u8 = 8;
/// Default full-charge terminal voltage in millivolts.
pub const DEFAULT_V_FULL_MV: i32 = 4150;
/// Default empty terminal voltage in millivolts.
pub const DEFAULT_V_EMPTY_MV: i32 = 2800;
/// Default voltage a cell must recover to before leaving post-discharge rest.
pub const DEFAULT_V_RECOVER_MV: i32 = 3000;
/// Default charge-termination current in milliamps.
pub const DEFAULT_I_TERM_CH_MA: i32 = 50;
/// Default voltage jump threshold (battery insertion) in millivolts.
pub const DEFAULT_V_JUMP_MV: i32 = 2000;
/// Default voltage drop threshold (battery removal) in millivolts.
pub const DEFAULT_V_DROP_MV: i32 = 2000;
/// Window over which a voltage jump must develop, in milliseconds.
pub const DEFAULT_V_JUMP_WINDOW_MS: u32 = 300;
/// Window over which a voltage drop must develop (slower), in milliseconds.
pub const DEFAULT_V_DROP_WINDOW_MS: u32 = 500;
/// Default current edge threshold in milliamps.
pub const DEFAULT_I_EDGE_MA: i32 = 200;
/// Window over which a current edge must develop, in milliseconds.
pub const DEFAULT_I_EDGE_WINDOW_MS: u32 = 100;
/// Default telemetry decimation: one sample record per this many samples.
pub const DEFAULT_TELEMETRY_DECIMATION: u16 = 20;

/// Linear calibration for one ADC measurement point: `physical = (raw + offset) * gain`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Calibration {
    pub offset: i32,
    pub gain: f32,
}

impl Calibration {
    /// Identity calibration: raw counts already are physical units.
    pub const fn identity() -> Self {
        Self {
            offset: 0,
            gain: 1.0,
        }
    }

    /// Converts a raw ADC reading to physical units, rounded to the nearest integer.
    pub fn apply(&self, raw: i32) -> i32 {
        let value = (raw + self.offset) as f32 * self.gain;
        if value >= 0.0 {
            (value + 0.5) as i32
        } else {
            (value - 0.5) as i32
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::identity()
    }
}

/// Calibration triple for a channel's three measurement points.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct CalibrationSet {
    /// Battery terminal voltage divider.
    pub v_batt: Calibration,
    /// Charge-leg shunt. The shunt value folds into the gain.
    pub i_ch: Calibration,
    /// Discharge-leg shunt.
    pub i_dch: Calibration,
}

/// Full configuration for one channel.
///
/// All fields are plain values; the supervisor decides when a write is
/// permitted (only while the channel is electrically idle).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    pub sample_period_ms: u32,
    pub rest_s: u32,
    pub rest_max_s: u32,
    pub max_cycles: u8,
    pub v_full_mv: i32,
    pub v_empty_mv: i32,
    pub v_recover_mv: i32,
    pub i_term_ch_ma: i32,
    pub v_jump_mv: i32,
    pub v_drop_mv: i32,
    pub v_jump_window_ms: u32,
    pub v_drop_window_ms: u32,
    pub i_edge_ma: i32,
    pub i_edge_window_ms: u32,
    pub telemetry_decimation: u16,
    pub calibration: CalibrationSet,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: DEFAULT_SAMPLE_PERIOD_MS,
            rest_s: DEFAULT_REST_S,
            rest_max_s: DEFAULT_REST_MAX_S,
            max_cycles: DEFAULT_MAX_CYCLES,
            v_full_mv: DEFAULT_V_FULL_MV,
            v_empty_mv: DEFAULT_V_EMPTY_MV,
            v_recover_mv: DEFAULT_V_RECOVER_MV,
            i_term_ch_ma: DEFAULT_I_TERM_CH_MA,
            v_jump_mv: DEFAULT_V_JUMP_MV,
            v_drop_mv: DEFAULT_V_DROP_MV,
            v_jump_window_ms: DEFAULT_V_JUMP_WINDOW_MS,
            v_drop_window_ms: DEFAULT_V_DROP_WINDOW_MS,
            i_edge_ma: DEFAULT_I_EDGE_MA,
            i_edge_window_ms: DEFAULT_I_EDGE_WINDOW_MS,
            telemetry_decimation: DEFAULT_TELEMETRY_DECIMATION,
            calibration: CalibrationSet::default(),
        }
    }
}

/// The three measurement points a channel is calibrated for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MeasurePoint {
    VBatt,
    ICh,
    IDch,
}

/// Errors surfaced while applying configuration values.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The key is not one of the recognized configuration keys.
    UnknownKey,
    /// The value is outside the accepted range for the key.
    InvalidValue,
    /// The channel is not in a state that permits configuration writes.
    Busy,
}

impl ChannelConfig {
    /// Sample period in microseconds.
    pub const fn sample_period_us(&self) -> u64 {
        self.sample_period_ms as u64 * 1_000
    }

    /// Largest inter-sample gap the integrator will bridge (`5 * T_s`).
    pub const fn max_sample_gap_us(&self) -> u64 {
        self.sample_period_us() * 5
    }

    /// Applies a single recognized key/value pair.
    ///
    /// Key names match the external configuration file verbatim.
    pub fn set(&mut self, key: &str, value: i64) -> Result<(), ConfigError> {
        match key {
            "T_s_ms" => self.sample_period_ms = positive_u32(value)?,
            "T_rest_s" => self.rest_s = positive_u32(value)?,
            "T_rest_max_s" => self.rest_max_s = positive_u32(value)?,
            "max_cycles" => {
                if !(1..=MAX_CYCLES_LIMIT as i64).contains(&value) {
                    return Err(ConfigError::InvalidValue);
                }
                self.max_cycles = value as u8;
            }
            "V_full_mV" => self.v_full_mv = positive_i32(value)?,
            "V_empty_mV" => self.v_empty_mv = positive_i32(value)?,
            "V_recover_mV" => self.v_recover_mv = positive_i32(value)?,
            "I_term_ch_mA" => self.i_term_ch_ma = positive_i32(value)?,
            "v_jump_mV" => self.v_jump_mv = positive_i32(value)?,
            "v_drop_mV" => self.v_drop_mv = positive_i32(value)?,
            "v_jump_window_ms" => self.v_jump_window_ms = positive_u32(value)?,
            "v_drop_window_ms" => self.v_drop_window_ms = positive_u32(value)?,
            "i_edge_mA" => self.i_edge_ma = positive_i32(value)?,
            "i_edge_window_ms" => self.i_edge_window_ms = positive_u32(value)?,
            "telemetry_decimation" => {
                if !(1..=i64::from(u16::MAX)).contains(&value) {
                    return Err(ConfigError::InvalidValue);
                }
                self.telemetry_decimation = value as u16;
            }
            _ => return Err(ConfigError::UnknownKey),
        }
        Ok(())
    }

    /// Replaces the `(offset, gain)` pair for one measurement point.
    pub fn set_calibration(
        &mut self,
        point: MeasurePoint,
        calibration: Calibration,
    ) -> Result<(), ConfigError> {
        if !calibration.gain.is_finite() || calibration.gain == 0.0 {
            return Err(ConfigError::InvalidValue);
        }
        match point {
            MeasurePoint::VBatt => self.calibration.v_batt = calibration,
            MeasurePoint::ICh => self.calibration.i_ch = calibration,
            MeasurePoint::IDch => self.calibration.i_dch = calibration,
        }
        Ok(())
    }
}

fn positive_u32(value: i64) -> Result<u32, ConfigError> {
    if (1..=i64::from(u32::MAX)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(ConfigError::InvalidValue)
    }
}

fn positive_i32(value: i64) -> Result<i32, ConfigError> {
    if (1..=i64::from(i32::MAX)).contains(&value) {
        Ok(value as i32)
    } else {
        Err(ConfigError::InvalidValue)
    }
}
