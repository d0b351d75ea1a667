//! Capacity-measurement runs driven end to end: supervisor, controller,
//! deriver, integrator, and sequencer together.

use std::cell::RefCell;
use std::rc::Rc;

use heapless::String as HeaplessString;
use tester_core::channel::ChannelSupervisor;
use tester_core::command::OperatorEvent;
use tester_core::config::ChannelConfig;
use tester_core::controller::{BcState, Leg, SwitchDriver, SwitchError};
use tester_core::sample::{ChannelId, Sample};
use tester_core::soc::{SocOutcome, SocState};
use tester_core::telemetry::{ChannelQueue, FaultKind, Record, RecordKind, TelemetrySink};

const T_S_US: u64 = 50_000;

/// Rest period used by these tests; cut down from the 300 s default so a
/// full run stays quick.
const REST_S: i64 = 5;

#[derive(Clone, Default)]
struct RecordingSwitch {
    levels: Rc<RefCell<(bool, bool)>>,
}

impl SwitchDriver for RecordingSwitch {
    fn set(&mut self, leg: Leg, on: bool) -> Result<(), SwitchError> {
        let mut levels = self.levels.borrow_mut();
        match leg {
            Leg::Charge => levels.0 = on,
            Leg::Discharge => levels.1 = on,
        }
        Ok(())
    }
}

struct CollectSink(Vec<Record>);

impl TelemetrySink for CollectSink {
    fn try_send(&mut self, record: &Record) -> bool {
        self.0.push(record.clone());
        true
    }
}

struct Rig {
    sup: ChannelSupervisor<RecordingSwitch>,
    queue: ChannelQueue,
    records: CollectSink,
    t_us: u64,
}

impl Rig {
    fn new(max_cycles: i64) -> Self {
        let mut rig = Self {
            sup: ChannelSupervisor::new(
                ChannelId::ALL[0],
                ChannelConfig::default(),
                RecordingSwitch::default(),
            ),
            queue: ChannelQueue::new(),
            records: CollectSink(Vec::new()),
            t_us: 0,
        };
        rig.sup
            .update_config(|config| {
                config.set("max_cycles", max_cycles)?;
                config.set("T_rest_s", REST_S)?;
                config.set("T_rest_max_s", 3 * REST_S)
            })
            .unwrap();
        rig
    }

    fn command(&mut self, event: OperatorEvent) {
        self.sup.handle_operator(event, self.t_us, &mut self.queue);
        self.drain();
    }

    fn step(&mut self, v_mv: i32, i_ch_ma: i32, i_dch_ma: i32) {
        self.t_us += T_S_US;
        let sample = Sample {
            channel: ChannelId::ALL[0],
            t_us: self.t_us,
            v_batt_mv: v_mv,
            i_ch_ma,
            i_dch_ma,
        };
        self.sup.ingest_sample(&sample, &mut self.queue);
        self.sup.tick(self.t_us, &mut self.queue);
        self.drain();
    }

    fn drain(&mut self) {
        self.queue.drain_into(&mut self.records);
    }

    fn insert_battery(&mut self, id: &str) {
        self.command(OperatorEvent::Init);
        for _ in 0..4 {
            self.step(0, 0, 0);
        }
        self.step(3700, 0, 0);
        self.command(OperatorEvent::GetId);
        self.command(OperatorEvent::SetId(HeaplessString::try_from(id).unwrap()));
        assert_eq!(self.sup.bc_state(), Some(BcState::BatId));
        self.sup.arm_soc(true);
    }

    /// Feeds samples matching whatever phase the channel is in until the
    /// sequencer reaches an end state or `limit` samples have passed.
    fn run_protocol(&mut self, limit: usize) {
        for _ in 0..limit {
            if self.sup.soc().state().is_terminal() {
                return;
            }
            match self.sup.bc_state() {
                // Charging: already at the full-voltage tail, so the
                // termination clock is running from the first sample.
                Some(BcState::Charge) => self.step(4160, 20, 0),
                // Discharging: under the empty threshold from the start.
                Some(BcState::Discharge) => self.step(2750, 0, 550),
                // Resting or idle: a recovered cell.
                _ => self.step(3600, 0, 0),
            }
        }
        panic!(
            "run did not finish within {limit} samples (soc: {:?}, bc: {:?})",
            self.sup.soc().state(),
            self.sup.bc_state()
        );
    }

    fn soc_transitions(&self) -> Vec<(SocState, SocState)> {
        self.records
            .0
            .iter()
            .filter_map(|record| match &record.kind {
                RecordKind::SocTransition { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    fn soc_results(&self) -> Vec<&Record> {
        self.records
            .0
            .iter()
            .filter(|record| matches!(record.kind, RecordKind::SocResult { .. }))
            .collect()
    }
}

fn states(transitions: &[(SocState, SocState)]) -> Vec<SocState> {
    let mut states = vec![transitions[0].0];
    states.extend(transitions.iter().map(|(_, to)| *to));
    states
}

#[test]
fn two_cycle_run_completes_with_two_cycle_records() {
    let mut rig = Rig::new(2);
    rig.insert_battery("D4");
    rig.command(OperatorEvent::Charge);
    assert_eq!(rig.sup.soc().state(), SocState::Charging1st);
    assert_eq!(rig.sup.bc_state(), Some(BcState::Charge));

    // Three 30 s charge tails, two 2 s discharges, four 5 s rests: well
    // under 60k samples.
    rig.run_protocol(60_000);

    use SocState::*;
    assert_eq!(
        states(&rig.soc_transitions()),
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

    let results = rig.soc_results();
    assert_eq!(results.len(), 1);
    match &results[0].kind {
        RecordKind::SocResult {
            outcome,
            cycles,
            battery_id,
            ..
        } => {
            assert_eq!(*outcome, SocOutcome::Complete);
            assert_eq!(cycles.len(), 2);
            assert_eq!(battery_id.as_str(), "D4");
            // Each 2 s discharge at 550 mA is ~0.3 mAh, rounded to 0; the
            // rest-entry voltage is the discharged terminal voltage.
            assert_eq!(cycles[0].cycle, 1);
            assert_eq!(cycles[1].cycle, 2);
            assert_eq!(cycles[0].rest_start_v_mv, 2750);
            assert_eq!(cycles[0].rest_end_v_mv, 3600);
            assert!(cycles[0].t_discharge_s >= 2);
        }
        _ => unreachable!(),
    }

    // The controller parks in BAT_ID with a zeroed accumulator.
    assert_eq!(rig.sup.bc_state(), Some(BcState::BatId));
    assert_eq!(rig.sup.counter().totals(Leg::Charge).mah, 0.0);
}

#[test]
fn single_cycle_run_records_exactly_one_cycle() {
    let mut rig = Rig::new(1);
    rig.insert_battery("E5");
    rig.command(OperatorEvent::Charge);
    rig.run_protocol(40_000);

    use SocState::*;
    assert_eq!(
        states(&rig.soc_transitions()),
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

    match &rig.soc_results()[0].kind {
        RecordKind::SocResult { cycles, .. } => assert_eq!(cycles.len(), 1),
        _ => unreachable!(),
    }
}

#[test]
fn cancel_during_rest_leaves_the_controller_in_place() {
    let mut rig = Rig::new(2);
    rig.insert_battery("F6");
    rig.command(OperatorEvent::Charge);

    // Finish the priming charge; the sequencer moves to the first rest.
    for _ in 0..610 {
        if rig.sup.soc().state() == SocState::RestCh {
            break;
        }
        rig.step(4160, 20, 0);
    }
    assert_eq!(rig.sup.soc().state(), SocState::RestCh);
    assert_eq!(rig.sup.bc_state(), Some(BcState::BatId));

    // Part way into the rest, the operator cancels.
    for _ in 0..20 {
        rig.step(3600, 0, 0);
    }
    rig.command(OperatorEvent::Cancel);

    assert_eq!(rig.sup.soc().state(), SocState::Cancel);
    assert_eq!(rig.sup.bc_state(), Some(BcState::BatId));

    match &rig.soc_results()[0].kind {
        RecordKind::SocResult { outcome, cycles, .. } => {
            assert_eq!(*outcome, SocOutcome::Canceled);
            assert!(cycles.is_empty());
        }
        _ => unreachable!(),
    }

    // The rest timer is dead: more idle samples change nothing.
    for _ in 0..200 {
        rig.step(3600, 0, 0);
    }
    assert_eq!(rig.sup.soc().state(), SocState::Cancel);
    assert_eq!(rig.sup.bc_state(), Some(BcState::BatId));
}

#[test]
fn yank_during_discharge_errors_the_run_and_waits_for_the_operator() {
    let mut rig = Rig::new(2);
    rig.insert_battery("G7");
    rig.command(OperatorEvent::Charge);

    // Through the priming charge and first rest, into the discharge.
    for _ in 0..1_000 {
        if rig.sup.bc_state() == Some(BcState::Discharge) {
            break;
        }
        match rig.sup.bc_state() {
            Some(BcState::Charge) => rig.step(4160, 20, 0),
            _ => rig.step(3600, 0, 0),
        }
    }
    assert_eq!(rig.sup.bc_state(), Some(BcState::Discharge));
    assert_eq!(rig.sup.soc().state(), SocState::Discharging);

    // Healthy discharge for a bit, voltage still above empty.
    for _ in 0..200 {
        rig.step(3700, 0, 550);
    }

    // Yank: current and voltage collapse. The controller lands in YANKED,
    // the sequencer observes the inconsistency and errors out.
    for _ in 0..4 {
        rig.step(500, 0, 0);
    }

    assert_eq!(rig.sup.bc_state(), Some(BcState::Yanked));
    assert_eq!(rig.sup.soc().state(), SocState::Error);

    assert!(rig.records.0.iter().any(|record| matches!(
        record.kind,
        RecordKind::Fault {
            fault: FaultKind::Protocol,
            ..
        }
    )));
    match &rig.soc_results()[0].kind {
        RecordKind::SocResult { outcome, .. } => assert_eq!(*outcome, SocOutcome::Error),
        _ => unreachable!(),
    }

    // Operator resets the controller; the sequencer stays in ERROR until
    // the next run is armed.
    rig.command(OperatorEvent::Reset);
    assert_eq!(rig.sup.bc_state(), Some(BcState::NoBat));
    assert!(rig.sup.battery().is_none());
    assert_eq!(rig.sup.soc().state(), SocState::Error);
}
