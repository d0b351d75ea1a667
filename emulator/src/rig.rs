//! Simulated measurement rig: four cell holders, a shared ADC, and the
//! MOSFET pairs, all backed by one mutable state the engine reaches through
//! its hardware traits.

use std::cell::RefCell;
use std::rc::Rc;

use tester_core::controller::{Leg, SwitchDriver, SwitchError};
use tester_core::sample::{AdcReader, AdcError, ChannelId, RawSweep, MAX_CHANNELS};

/// Discharge load resistance in ohms, matching the physical rig.
const LOAD_R: f64 = 5.0;

/// A very small electrical model of one 18650 holder.
///
/// Capacities default to a scaled-down 50 mAh so a full measurement run
/// plays out in minutes of simulated time rather than hours.
#[derive(Clone, Debug)]
pub struct CellModel {
    pub present: bool,
    pub capacity_mah: f64,
    pub soc_mah: f64,
}

impl Default for CellModel {
    fn default() -> Self {
        Self {
            present: false,
            capacity_mah: 50.0,
            soc_mah: 0.0,
        }
    }
}

impl CellModel {
    fn frac(&self) -> f64 {
        (self.soc_mah / self.capacity_mah).clamp(0.0, 1.0)
    }

    /// Open-circuit voltage, linearised over the usable range.
    fn ocv_mv(&self) -> f64 {
        3_000.0 + 1_200.0 * self.frac()
    }

    fn terminal_mv(&self, charging: bool, discharging: bool) -> f64 {
        if !self.present {
            return 0.0;
        }
        if charging {
            (self.ocv_mv() + 80.0).min(4_220.0)
        } else if discharging {
            self.ocv_mv() - 400.0
        } else {
            self.ocv_mv()
        }
    }

    /// CC charge at 500 mA with a CV taper over the last few percent.
    fn charge_current_ma(&self) -> f64 {
        let frac = self.frac();
        if frac < 0.95 {
            500.0
        } else {
            (500.0 * (1.0 - frac) / 0.05).max(15.0)
        }
    }

    fn discharge_current_ma(&self, terminal_mv: f64) -> f64 {
        (terminal_mv / LOAD_R).max(0.0)
    }

    fn step(&mut self, dt_us: u64, charging: bool, discharging: bool) {
        if !self.present {
            return;
        }
        let dt_h = dt_us as f64 / 3_600_000_000.0;
        if charging {
            self.soc_mah = (self.soc_mah + self.charge_current_ma() * dt_h).min(self.capacity_mah);
        }
        if discharging {
            let terminal = self.terminal_mv(false, true);
            self.soc_mah = (self.soc_mah - self.discharge_current_ma(terminal) * dt_h).max(0.0);
        }
    }
}

#[derive(Default)]
struct RigState {
    cells: [CellModel; MAX_CHANNELS],
    switches: [(bool, bool); MAX_CHANNELS],
}

/// Shared handle to the simulated rig.
#[derive(Clone, Default)]
pub struct SimRig {
    state: Rc<RefCell<RigState>>,
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seats a cell with the given capacity and initial charge fraction.
    pub fn insert(&self, channel: ChannelId, capacity_mah: f64, frac: f64) {
        let mut state = self.state.borrow_mut();
        state.cells[channel.index()] = CellModel {
            present: true,
            capacity_mah,
            soc_mah: capacity_mah * frac.clamp(0.0, 1.0),
        };
    }

    /// Pulls the cell from its holder.
    pub fn remove(&self, channel: ChannelId) {
        let mut state = self.state.borrow_mut();
        state.cells[channel.index()].present = false;
    }

    /// Advances the electrical model by one tick.
    pub fn step(&self, dt_us: u64) {
        let mut state = self.state.borrow_mut();
        for index in 0..MAX_CHANNELS {
            let (charging, discharging) = state.switches[index];
            state.cells[index].step(dt_us, charging, discharging);
        }
    }

    pub fn cell(&self, channel: ChannelId) -> CellModel {
        self.state.borrow().cells[channel.index()].clone()
    }

    /// ADC view of the rig. Identity calibration: counts are millivolts
    /// and milliamps.
    pub fn adc(&self) -> SimAdc {
        SimAdc {
            state: Rc::clone(&self.state),
        }
    }

    /// Switch driver bound to one channel.
    pub fn switch(&self, channel: ChannelId) -> SimSwitch {
        SimSwitch {
            state: Rc::clone(&self.state),
            channel,
        }
    }
}

/// Simulated ADS1x15 sweep source.
pub struct SimAdc {
    state: Rc<RefCell<RigState>>,
}

impl AdcReader for SimAdc {
    fn sweep(&mut self, channel: ChannelId) -> Result<RawSweep, AdcError> {
        let state = self.state.borrow();
        let cell = &state.cells[channel.index()];
        let (charging, discharging) = state.switches[channel.index()];

        let terminal = cell.terminal_mv(charging, discharging);
        let i_ch = if charging && cell.present {
            cell.charge_current_ma()
        } else {
            0.0
        };
        let i_dch = if discharging && cell.present {
            cell.discharge_current_ma(terminal)
        } else {
            0.0
        };

        Ok(RawSweep {
            v_batt: terminal as i32,
            i_ch: i_ch as i32,
            i_dch: i_dch as i32,
        })
    }
}

/// Simulated MOSFET pair for one channel.
pub struct SimSwitch {
    state: Rc<RefCell<RigState>>,
    channel: ChannelId,
}

impl SwitchDriver for SimSwitch {
    fn set(&mut self, leg: Leg, on: bool) -> Result<(), SwitchError> {
        let mut state = self.state.borrow_mut();
        let switches = &mut state.switches[self.channel.index()];
        match leg {
            Leg::Charge => switches.0 = on,
            Leg::Discharge => switches.1 = on,
        }
        Ok(())
    }
}
