//! State-of-charge measurement sequencer.
//!
//! The runner drives a full capacity measurement on top of the battery
//! controller: a priming charge, then `max_cycles` discharge/charge pairs
//! separated by rest periods, recording per-cycle charge figures along the
//! way. It never touches hardware; each poll observes the controller state
//! and the integrator read-only and hands back the controller commands to
//! issue, keeping the dependency one-way.
//!
//! Cycle counting: `num_cycles` increments on entry to the post-charge rest
//! (including after the priming charge), and the run completes when a charge
//! finishes with `num_cycles == max_cycles`. Post-discharge rest ends only
//! once the cell voltage has recovered; a cell that never recovers aborts
//! the run.

use core::fmt::Write as _;

use heapless::{String, Vec};
use serde::Serialize;

use crate::config::{ChannelConfig, MAX_CYCLES_LIMIT};
use crate::controller::{BcState, Leg};
use crate::coulomb::CoulombCounter;
use crate::sample::{ChannelId, TimestampMicros};

/// States of the measurement sequencer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocState {
    Ready,
    #[serde(rename = "charging_1st")]
    Charging1st,
    Charging,
    RestCh,
    Discharging,
    RestDch,
    Complete,
    Cancel,
    Error,
}

impl SocState {
    /// Returns `true` while a run is underway.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            SocState::Charging1st
                | SocState::Charging
                | SocState::RestCh
                | SocState::Discharging
                | SocState::RestDch
        )
    }

    /// Returns `true` for the end states of a run.
    pub const fn is_terminal(self) -> bool {
        matches!(self, SocState::Complete | SocState::Cancel | SocState::Error)
    }
}

/// How a run ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocOutcome {
    Complete,
    Canceled,
    Error,
}

/// Controller commands the sequencer asks the supervisor to issue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SocCommand {
    Charge,
    Discharge,
    Pause,
    ResetMetrics,
}

/// Record of one sequencer transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SocTransition {
    pub from: SocState,
    pub to: SocState,
    pub num_cycles: u8,
    pub max_cycles: u8,
    pub t_us: TimestampMicros,
}

/// Figures for one completed discharge/charge cycle.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CycleMetrics {
    pub cycle: u8,
    pub charge_mah: i32,
    pub charge_mwh: i32,
    pub discharge_mah: i32,
    pub discharge_mwh: i32,
    pub t_charge_s: u32,
    pub t_discharge_s: u32,
    pub rest_start_v_mv: i32,
    pub rest_end_v_mv: i32,
}

/// Everything one poll of the sequencer produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SocStep {
    /// Controller commands to apply, in order.
    pub commands: Vec<SocCommand, 2>,
    /// Transition taken during this poll, if any.
    pub transition: Option<SocTransition>,
    /// Set when the run just reached an end state.
    pub finished: Option<SocOutcome>,
}

/// Discharge-side figures collected while the matching charge is still due.
#[derive(Copy, Clone, Debug, Default)]
struct PendingCycle {
    discharge_mah: i32,
    discharge_mwh: i32,
    t_discharge_s: u32,
    rest_start_v_mv: i32,
    rest_end_v_mv: i32,
}

/// Maximum length of a generated run identifier.
pub const RUN_ID_LEN: usize = 12;

/// Per-channel measurement sequencer.
pub struct SocRunner {
    channel: ChannelId,
    state: SocState,
    num_cycles: u8,
    max_cycles: u8,
    rest_us: u64,
    rest_max_us: u64,
    v_recover_mv: i32,
    rest_started_at: TimestampMicros,
    run_started_at: TimestampMicros,
    run_seq: u16,
    run_id: String<RUN_ID_LEN>,
    cycles: Vec<CycleMetrics, { MAX_CYCLES_LIMIT as usize }>,
    pending: PendingCycle,
}

impl SocRunner {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            state: SocState::Ready,
            num_cycles: 0,
            max_cycles: 0,
            rest_us: 0,
            rest_max_us: 0,
            v_recover_mv: 0,
            rest_started_at: 0,
            run_started_at: 0,
            run_seq: 0,
            run_id: String::new(),
            cycles: Vec::new(),
            pending: PendingCycle::default(),
        }
    }

    pub fn state(&self) -> SocState {
        self.state
    }

    /// Returns `true` while a measurement run is in progress.
    pub fn in_progress(&self) -> bool {
        self.state.is_active()
    }

    /// Cycle records accumulated by the current (or just finished) run.
    pub fn cycles(&self) -> &[CycleMetrics] {
        &self.cycles
    }

    /// Identifier grouping the records of one run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_started_at(&self) -> TimestampMicros {
        self.run_started_at
    }

    pub fn num_cycles(&self) -> u8 {
        self.num_cycles
    }

    pub fn max_cycles(&self) -> u8 {
        self.max_cycles
    }

    /// Arms and starts a run.
    ///
    /// A runner sitting in an end state re-arms through READY first. The
    /// controller must be idle with an identified battery; anything else is
    /// a protocol error and the run ends immediately.
    pub fn start(
        &mut self,
        bc: Option<BcState>,
        config: &ChannelConfig,
        now: TimestampMicros,
    ) -> SocStep {
        let mut step = SocStep::default();

        if self.state.is_terminal() {
            self.state = SocState::Ready;
        }
        if self.state != SocState::Ready {
            return step;
        }

        self.num_cycles = 0;
        self.max_cycles = config.max_cycles;
        self.rest_us = config.rest_s as u64 * 1_000_000;
        self.rest_max_us = config.rest_max_s as u64 * 1_000_000;
        self.v_recover_mv = config.v_recover_mv;
        self.cycles = Vec::new();
        self.pending = PendingCycle::default();
        self.run_started_at = now;
        self.run_seq = self.run_seq.wrapping_add(1);
        self.run_id = String::new();
        let _ = write!(self.run_id, "S{}-{:04x}", self.channel.number(), self.run_seq);

        if bc != Some(BcState::BatId) {
            self.transition(SocState::Error, now, &mut step);
            step.finished = Some(SocOutcome::Error);
            return step;
        }

        let _ = step.commands.push(SocCommand::Charge);
        self.transition(SocState::Charging1st, now, &mut step);
        step
    }

    /// Cancels the run in flight, winding the controller back to idle.
    pub fn cancel(&mut self, bc: Option<BcState>, now: TimestampMicros) -> SocStep {
        let mut step = SocStep::default();
        if !self.state.is_active() {
            return step;
        }

        step.commands = wind_down(bc);
        self.transition(SocState::Cancel, now, &mut step);
        step.finished = Some(SocOutcome::Canceled);
        step
    }

    /// One poll: observes the controller and integrator, advances the run.
    pub fn tick(
        &mut self,
        bc: Option<BcState>,
        counter: &CoulombCounter,
        v_batt_mv: i32,
        now: TimestampMicros,
    ) -> SocStep {
        let mut step = SocStep::default();
        if !self.state.is_active() {
            return step;
        }

        if !expected_bc(self.state, bc) {
            step.commands = wind_down(bc);
            self.transition(SocState::Error, now, &mut step);
            step.finished = Some(SocOutcome::Error);
            return step;
        }

        match self.state {
            SocState::Charging1st => {
                if bc == Some(BcState::Charged) {
                    // Priming charge: figures are discarded, not recorded.
                    let _ = step.commands.push(SocCommand::ResetMetrics);
                    self.enter_rest_ch(now, &mut step);
                }
            }
            SocState::RestCh => {
                if now.saturating_sub(self.rest_started_at) >= self.rest_us {
                    let _ = step.commands.push(SocCommand::Discharge);
                    self.transition(SocState::Discharging, now, &mut step);
                }
            }
            SocState::Discharging => {
                if bc == Some(BcState::Discharged) {
                    let totals = counter.totals(Leg::Discharge);
                    self.pending = PendingCycle {
                        discharge_mah: totals.mah_rounded(),
                        discharge_mwh: totals.mwh_rounded(),
                        t_discharge_s: totals.active_s(),
                        rest_start_v_mv: v_batt_mv,
                        rest_end_v_mv: 0,
                    };
                    let _ = step.commands.push(SocCommand::ResetMetrics);
                    self.rest_started_at = now;
                    self.transition(SocState::RestDch, now, &mut step);
                }
            }
            SocState::RestDch => {
                let rested = now.saturating_sub(self.rest_started_at);
                if rested >= self.rest_us && v_batt_mv >= self.v_recover_mv {
                    self.pending.rest_end_v_mv = v_batt_mv;
                    let _ = step.commands.push(SocCommand::Charge);
                    self.transition(SocState::Charging, now, &mut step);
                } else if rested >= self.rest_max_us {
                    // Cell voltage never recovered after the discharge.
                    step.commands = wind_down(bc);
                    self.transition(SocState::Error, now, &mut step);
                    step.finished = Some(SocOutcome::Error);
                }
            }
            SocState::Charging => {
                if bc == Some(BcState::Charged) {
                    let totals = counter.totals(Leg::Charge);
                    let record = CycleMetrics {
                        cycle: self.num_cycles,
                        charge_mah: totals.mah_rounded(),
                        charge_mwh: totals.mwh_rounded(),
                        discharge_mah: self.pending.discharge_mah,
                        discharge_mwh: self.pending.discharge_mwh,
                        t_charge_s: totals.active_s(),
                        t_discharge_s: self.pending.t_discharge_s,
                        rest_start_v_mv: self.pending.rest_start_v_mv,
                        rest_end_v_mv: self.pending.rest_end_v_mv,
                    };
                    let _ = self.cycles.push(record);
                    let _ = step.commands.push(SocCommand::ResetMetrics);

                    if self.num_cycles == self.max_cycles {
                        self.transition(SocState::Complete, now, &mut step);
                        step.finished = Some(SocOutcome::Complete);
                    } else {
                        self.enter_rest_ch(now, &mut step);
                    }
                }
            }
            _ => {}
        }

        step
    }

    fn enter_rest_ch(&mut self, now: TimestampMicros, step: &mut SocStep) {
        self.num_cycles += 1;
        self.rest_started_at = now;
        self.transition(SocState::RestCh, now, step);
    }

    fn transition(&mut self, to: SocState, now: TimestampMicros, step: &mut SocStep) {
        step.transition = Some(SocTransition {
            from: self.state,
            to,
            num_cycles: self.num_cycles,
            max_cycles: self.max_cycles,
            t_us: now,
        });
        self.state = to;
    }
}

/// Controller states consistent with each sequencer phase.
fn expected_bc(state: SocState, bc: Option<BcState>) -> bool {
    let Some(bc) = bc else {
        return false;
    };
    match state {
        SocState::Charging1st | SocState::Charging => matches!(
            bc,
            BcState::Charge | BcState::ChargePause | BcState::Charged
        ),
        SocState::Discharging => matches!(
            bc,
            BcState::Discharge | BcState::DischargePause | BcState::Discharged
        ),
        SocState::RestCh | SocState::RestDch => bc == BcState::BatId,
        _ => true,
    }
}

/// Commands that walk the controller back to BAT_ID from wherever it is.
///
/// Pause applies only while current flows; the metrics reset only from a
/// paused or terminal state. Anything else is left alone for the operator.
fn wind_down(bc: Option<BcState>) -> Vec<SocCommand, 2> {
    let mut commands = Vec::new();
    match bc {
        Some(BcState::Charge | BcState::Discharge) => {
            let _ = commands.push(SocCommand::Pause);
            let _ = commands.push(SocCommand::ResetMetrics);
        }
        Some(
            BcState::ChargePause
            | BcState::DischargePause
            | BcState::Charged
            | BcState::Discharged,
        ) => {
            let _ = commands.push(SocCommand::ResetMetrics);
        }
        _ => {}
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    const SEC: u64 = 1_000_000;

    fn runner() -> SocRunner {
        SocRunner::new(ChannelId::ALL[0])
    }

    fn config(max_cycles: u8) -> ChannelConfig {
        let mut config = ChannelConfig::default();
        config.max_cycles = max_cycles;
        config
    }

    fn counter() -> CoulombCounter {
        CoulombCounter::new(250_000)
    }

    /// Drives the runner through a full run, returning the visited states.
    fn drive_run(max_cycles: u8) -> (SocRunner, std::vec::Vec<SocState>) {
        let mut soc = runner();
        let counter = counter();
        let mut now = 0;
        let mut visited = std::vec![SocState::Ready];
        let mut bc = BcState::BatId;

        let step = soc.start(Some(bc), &config(max_cycles), now);
        assert_eq!(&step.commands[..], [SocCommand::Charge]);
        bc = BcState::Charge;
        visited.push(soc.state());

        for _ in 0..200 {
            now += SEC;
            // Let the controller "finish" the phase the sequencer asked for.
            bc = match (soc.state(), bc) {
                (SocState::Charging1st | SocState::Charging, BcState::Charge) => BcState::Charged,
                (SocState::Discharging, BcState::Discharge) => BcState::Discharged,
                (_, other) => other,
            };

            let step = soc.tick(Some(bc), &counter, 3600, now);
            for command in &step.commands {
                bc = match command {
                    SocCommand::Charge => BcState::Charge,
                    SocCommand::Discharge => BcState::Discharge,
                    SocCommand::ResetMetrics => BcState::BatId,
                    SocCommand::Pause => bc,
                };
            }
            if step.transition.is_some() {
                visited.push(soc.state());
            }
            if soc.state().is_terminal() {
                break;
            }

            // Burn through rest periods.
            if matches!(soc.state(), SocState::RestCh | SocState::RestDch) {
                now += 301 * SEC;
            }
        }

        (soc, visited)
    }

    #[test]
    fn two_cycle_run_walks_the_full_protocol() {
        let (soc, visited) = drive_run(2);
        use SocState::*;
        assert_eq!(
            visited,
            [
                Ready,
                Charging1st,
                RestCh,
                Discharging,
                RestDch,
                Charging,
                RestCh,
                Discharging,
                RestDch,
                Charging,
                Complete,
            ]
        );
        assert_eq!(soc.cycles().len(), 2);
        assert_eq!(soc.cycles()[0].cycle, 1);
        assert_eq!(soc.cycles()[1].cycle, 2);
    }

    #[test]
    fn single_cycle_run_records_exactly_one_cycle() {
        let (soc, visited) = drive_run(1);
        use SocState::*;
        assert_eq!(
            visited,
            [
                Ready,
                Charging1st,
                RestCh,
                Discharging,
                RestDch,
                Charging,
                Complete,
            ]
        );
        assert_eq!(soc.cycles().len(), 1);
    }

    #[test]
    fn start_requires_an_identified_idle_battery() {
        let mut soc = runner();
        let step = soc.start(Some(BcState::NoBat), &config(2), 0);
        assert_eq!(soc.state(), SocState::Error);
        assert_eq!(step.finished, Some(SocOutcome::Error));
        assert!(step.commands.is_empty());
    }

    #[test]
    fn start_rearms_from_a_terminal_state() {
        let mut soc = runner();
        soc.start(Some(BcState::NoBat), &config(2), 0);
        assert_eq!(soc.state(), SocState::Error);

        let step = soc.start(Some(BcState::BatId), &config(2), 10);
        assert_eq!(soc.state(), SocState::Charging1st);
        assert_eq!(&step.commands[..], [SocCommand::Charge]);
    }

    #[test]
    fn run_ids_are_unique_per_run() {
        let mut soc = runner();
        soc.start(Some(BcState::BatId), &config(2), 0);
        let first: std::string::String = soc.run_id().into();
        soc.cancel(Some(BcState::BatId), 1);
        soc.start(Some(BcState::BatId), &config(2), 2);
        assert_ne!(soc.run_id(), first);
    }

    #[test]
    fn cancel_during_rest_leaves_the_controller_alone() {
        let mut soc = runner();
        let counter = counter();
        soc.start(Some(BcState::BatId), &config(2), 0);
        soc.tick(Some(BcState::Charged), &counter, 3700, SEC);
        assert_eq!(soc.state(), SocState::RestCh);

        let step = soc.cancel(Some(BcState::BatId), 120 * SEC);
        assert_eq!(soc.state(), SocState::Cancel);
        assert_eq!(step.finished, Some(SocOutcome::Canceled));
        assert!(step.commands.is_empty());
    }

    #[test]
    fn cancel_mid_charge_pauses_and_resets() {
        let mut soc = runner();
        soc.start(Some(BcState::BatId), &config(2), 0);

        let step = soc.cancel(Some(BcState::Charge), SEC);
        assert_eq!(
            &step.commands[..],
            [SocCommand::Pause, SocCommand::ResetMetrics]
        );
    }

    #[test]
    fn yank_during_discharge_is_a_protocol_error() {
        let mut soc = runner();
        let counter = counter();
        let mut now = 0;
        soc.start(Some(BcState::BatId), &config(2), now);
        now += SEC;
        soc.tick(Some(BcState::Charged), &counter, 3700, now);
        now += 301 * SEC;
        let step = soc.tick(Some(BcState::BatId), &counter, 3700, now);
        assert_eq!(&step.commands[..], [SocCommand::Discharge]);
        assert_eq!(soc.state(), SocState::Discharging);

        now += SEC;
        let step = soc.tick(Some(BcState::Yanked), &counter, 500, now);
        assert_eq!(soc.state(), SocState::Error);
        assert_eq!(step.finished, Some(SocOutcome::Error));
        // The controller is left for the operator to inspect and reset.
        assert!(step.commands.is_empty());
    }

    #[test]
    fn rest_after_discharge_waits_for_voltage_recovery() {
        let mut soc = runner();
        let counter = counter();
        let mut now = 0;
        soc.start(Some(BcState::BatId), &config(1), now);
        now += SEC;
        soc.tick(Some(BcState::Charged), &counter, 3700, now);
        now += 301 * SEC;
        soc.tick(Some(BcState::BatId), &counter, 3700, now);
        now += SEC;
        soc.tick(Some(BcState::Discharged), &counter, 2750, now);
        assert_eq!(soc.state(), SocState::RestDch);

        // Rest time elapsed but the cell still reads under V_recover.
        now += 301 * SEC;
        let step = soc.tick(Some(BcState::BatId), &counter, 2900, now);
        assert_eq!(soc.state(), SocState::RestDch);
        assert!(step.commands.is_empty());

        // Recovered: the next charge begins.
        now += SEC;
        let step = soc.tick(Some(BcState::BatId), &counter, 3200, now);
        assert_eq!(&step.commands[..], [SocCommand::Charge]);
        assert_eq!(soc.state(), SocState::Charging);
    }

    #[test]
    fn unrecovered_cell_aborts_the_run() {
        let mut soc = runner();
        let counter = counter();
        let mut now = 0;
        soc.start(Some(BcState::BatId), &config(1), now);
        now += SEC;
        soc.tick(Some(BcState::Charged), &counter, 3700, now);
        now += 301 * SEC;
        soc.tick(Some(BcState::BatId), &counter, 3700, now);
        now += SEC;
        soc.tick(Some(BcState::Discharged), &counter, 2750, now);

        now += 901 * SEC;
        let step = soc.tick(Some(BcState::BatId), &counter, 2900, now);
        assert_eq!(soc.state(), SocState::Error);
        assert_eq!(step.finished, Some(SocOutcome::Error));
    }
}
