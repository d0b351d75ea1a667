//! Coulomb counting: integrates the sampled current into delivered charge
//! (mAh) and energy (mWh), per direction.
//!
//! The counter is armed when the controller enters CHARGE or DISCHARGE and
//! sealed on any exit. A resume after pause appends a new window without
//! clearing the totals; only `reset_metrics` zeroes them. Charge uses the
//! trapezoid of consecutive current samples; energy uses the instantaneous
//! power of the newest sample. Samples with negative current, a non-finite
//! value, or a gap wider than the configured limit are dropped rather than
//! interpolated.

use serde::Serialize;

use crate::controller::Leg;
use crate::sample::{Sample, TimestampMicros};

const US_PER_HOUR: f64 = 3_600_000_000.0;

/// Accumulated totals for one direction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct EnergyTotals {
    /// Delivered/extracted charge in milliamp-hours.
    pub mah: f64,
    /// Delivered/extracted energy in milliwatt-hours.
    pub mwh: f64,
    /// Wall-clock time spent with current flowing, in microseconds.
    pub active_us: u64,
    /// Number of sealed measurement windows folded into the totals.
    pub windows: u32,
}

impl EnergyTotals {
    /// Charge rounded to whole milliamp-hours, as reported in telemetry.
    pub fn mah_rounded(&self) -> i32 {
        round(self.mah)
    }

    /// Energy rounded to whole milliwatt-hours.
    pub fn mwh_rounded(&self) -> i32 {
        round(self.mwh)
    }

    /// Active time in whole seconds.
    pub fn active_s(&self) -> u32 {
        (self.active_us / 1_000_000) as u32
    }
}

fn round(value: f64) -> i32 {
    if value >= 0.0 {
        (value + 0.5) as i32
    } else {
        (value - 0.5) as i32
    }
}

#[derive(Copy, Clone, Debug)]
struct Previous {
    t_us: TimestampMicros,
    i_ma: f64,
}

/// Per-channel charge/energy integrator.
pub struct CoulombCounter {
    armed: Option<Leg>,
    previous: Option<Previous>,
    max_gap_us: u64,
    charge: EnergyTotals,
    discharge: EnergyTotals,
    window_started_at: Option<TimestampMicros>,
}

impl CoulombCounter {
    pub fn new(max_gap_us: u64) -> Self {
        Self {
            armed: None,
            previous: None,
            max_gap_us,
            charge: EnergyTotals::default(),
            discharge: EnergyTotals::default(),
            window_started_at: None,
        }
    }

    /// Updates the gap limit after a configuration write.
    pub fn set_max_gap_us(&mut self, max_gap_us: u64) {
        self.max_gap_us = max_gap_us;
    }

    /// Direction currently being integrated, if any.
    pub fn armed(&self) -> Option<Leg> {
        self.armed
    }

    /// Timestamp at which the current window opened.
    pub fn window_started_at(&self) -> Option<TimestampMicros> {
        self.window_started_at
    }

    pub fn totals(&self, leg: Leg) -> &EnergyTotals {
        match leg {
            Leg::Charge => &self.charge,
            Leg::Discharge => &self.discharge,
        }
    }

    /// Opens a measurement window for `leg`. Totals accumulated by earlier
    /// windows are kept.
    pub fn arm(&mut self, leg: Leg, now: TimestampMicros) {
        self.armed = Some(leg);
        self.previous = None;
        self.window_started_at = Some(now);
    }

    /// Seals the current window (pause, completion, or yank).
    pub fn seal(&mut self) {
        if let Some(leg) = self.armed.take() {
            self.totals_mut(leg).windows += 1;
        }
        self.previous = None;
        self.window_started_at = None;
    }

    /// Zeroes both directions and drops any open window.
    pub fn reset(&mut self) {
        self.armed = None;
        self.previous = None;
        self.charge = EnergyTotals::default();
        self.discharge = EnergyTotals::default();
        self.window_started_at = None;
    }

    /// Folds one sample into the armed direction's totals.
    pub fn accumulate(&mut self, sample: &Sample) {
        let Some(leg) = self.armed else {
            return;
        };

        let i_ma = match leg {
            Leg::Charge => sample.i_ch_ma,
            Leg::Discharge => sample.i_dch_ma,
        } as f64;
        let v_mv = sample.v_batt_mv as f64;

        // Out-of-range readings are dropped without touching the baseline.
        if !(i_ma.is_finite() && v_mv.is_finite()) || i_ma < 0.0 {
            return;
        }

        let Some(previous) = self.previous else {
            self.previous = Some(Previous {
                t_us: sample.t_us,
                i_ma,
            });
            return;
        };

        let dt_us = sample.t_us.saturating_sub(previous.t_us);
        if dt_us > self.max_gap_us {
            // Too long since the last good sample; re-baseline instead of
            // integrating across the gap.
            self.previous = Some(Previous {
                t_us: sample.t_us,
                i_ma,
            });
            return;
        }

        let dt_h = dt_us as f64 / US_PER_HOUR;
        let totals = self.totals_mut(leg);
        totals.mah += (previous.i_ma + i_ma) / 2.0 * dt_h;
        totals.mwh += v_mv * i_ma * dt_h / 1_000.0;
        totals.active_us += dt_us;

        self.previous = Some(Previous {
            t_us: sample.t_us,
            i_ma,
        });
    }

    fn totals_mut(&mut self, leg: Leg) -> &mut EnergyTotals {
        match leg {
            Leg::Charge => &mut self.charge,
            Leg::Discharge => &mut self.discharge,
        }
    }
}
